//! Chat model collaborator
//!
//! The memory manager and the chat loop only talk to a [`ChatModel`]: one
//! blocking completion call and one streaming call. [`OpenAiChatModel`] is the
//! HTTP implementation; tests plug in stubs.

mod openai;

pub use openai::OpenAiChatModel;

use crate::{ChatmemError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A role-tagged message sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Streaming event from the chat model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Next text fragment, in arrival order
    Delta(String),
    /// Stream finished normally
    Done,
    /// Stream aborted
    Error(String),
}

/// Text-generation collaborator.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// One-shot completion. Empty content is an error.
    async fn complete(&self, model: &str, messages: Vec<ChatMessage>) -> Result<String>;

    /// Streamed completion. The receiver yields `Delta`s followed by exactly
    /// one `Done` or `Error`; it cannot be restarted.
    async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<StreamEvent>>;
}

/// Drain a stream, forwarding each fragment to `on_fragment` and returning
/// the concatenated text.
///
/// A stream that closes without `Done` counts as an error, so a dropped
/// connection never looks like a complete reply. An error from `on_fragment`
/// stops draining and is returned as is.
pub async fn collect_stream<F>(
    mut rx: mpsc::Receiver<StreamEvent>,
    mut on_fragment: F,
) -> Result<String>
where
    F: FnMut(&str) -> Result<()>,
{
    let mut text = String::new();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Delta(fragment) => {
                on_fragment(&fragment)?;
                text.push_str(&fragment);
            }
            StreamEvent::Done => return Ok(text),
            StreamEvent::Error(e) => {
                return Err(ChatmemError::Llm(format!("stream error: {e}")));
            }
        }
    }

    Err(ChatmemError::Llm(
        "stream closed before completion".to_string(),
    ))
}
