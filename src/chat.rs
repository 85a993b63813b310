//! Interactive chat loop.
//!
//! Each round trip: build the prompt from the memory context, stream the
//! reply (forwarding fragments as they arrive), then record the full reply in
//! memory. A failed stream records nothing.

use crate::config::DEFAULT_SENTINEL;
use crate::llm::{collect_stream, ChatMessage, ChatModel};
use crate::memory::{ConversationMemory, LlmSummarizer, SessionStore};
use crate::{ChatmemConfig, ChatmemError, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

/// Instruction placed ahead of the memory context in every reply prompt
pub const SYSTEM_INSTRUCTION: &str =
    "You are a powerful chatbot. Please answer the user's question based on the provided context.";

/// Where a session is persisted after each turn
struct Persistence {
    store: SessionStore,
    session_id: String,
}

/// One conversation: the chat model, its memory, and optional persistence
pub struct ChatSession {
    model: Arc<dyn ChatModel>,
    model_name: String,
    memory: ConversationMemory,
    sentinel: String,
    persistence: Option<Persistence>,
}

impl ChatSession {
    pub fn new(
        model: Arc<dyn ChatModel>,
        model_name: impl Into<String>,
        memory: ConversationMemory,
    ) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            memory,
            sentinel: DEFAULT_SENTINEL.to_string(),
            persistence: None,
        }
    }

    /// Build a session whose memory summarizes through the same chat model.
    pub fn from_config(config: &ChatmemConfig, model: Arc<dyn ChatModel>) -> Result<Self> {
        config.validate()?;
        let summarizer = Arc::new(LlmSummarizer::new(
            model.clone(),
            config.effective_summary_model(),
        ));
        let memory = ConversationMemory::new(summarizer, config.memory)?;
        Ok(Self::new(model, config.model.clone(), memory).with_sentinel(config.sentinel.clone()))
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    /// Persist memory to `store` under `session_id` after every completed turn.
    pub fn with_session_store(mut self, store: SessionStore, session_id: impl Into<String>) -> Self {
        self.persistence = Some(Persistence {
            store,
            session_id: session_id.into(),
        });
        self
    }

    /// Restore memory from the attached store, if a saved session exists.
    pub async fn resume(&mut self) -> Result<bool> {
        let Some(persistence) = &self.persistence else {
            return Ok(false);
        };
        let restored = persistence
            .store
            .restore_into(&persistence.session_id, &mut self.memory)
            .await?;
        if restored {
            info!(
                "Resumed session {} ({} buffered turns)",
                persistence.session_id,
                self.memory.len()
            );
        }
        Ok(restored)
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Prompt for the next reply: instruction, memory context, question.
    pub fn build_prompt(&self, query: &str) -> String {
        format!(
            "{}\n\n{}\n\nUser's question: {}",
            SYSTEM_INSTRUCTION,
            self.memory.load_context().summary_block,
            query
        )
    }

    /// Run one round trip. `on_fragment` sees every streamed fragment in order.
    ///
    /// Memory is updated only after the stream completes, with the full reply.
    /// An error from `on_fragment` aborts the turn before anything is recorded.
    pub async fn ask<F>(&mut self, query: &str, on_fragment: F) -> Result<String>
    where
        F: FnMut(&str) -> Result<()>,
    {
        let prompt = self.build_prompt(query);
        debug!("Reply prompt length: {}", prompt.len());

        let rx = self
            .model
            .stream(&self.model_name, vec![ChatMessage::user(prompt)])
            .await?;
        let reply = collect_stream(rx, on_fragment).await?;

        self.memory.save_context(query, &reply).await?;
        self.persist().await;
        Ok(reply)
    }

    async fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence
                .store
                .save(&persistence.session_id, &self.memory)
                .await
            {
                warn!("Failed to save session {}: {}", persistence.session_id, e);
            }
        }
    }

    /// Read questions from `input` until the sentinel line or EOF, streaming
    /// each reply to `output`.
    ///
    /// A failed turn is reported and the loop moves on to the next question.
    /// Failing to write to `output` ends the loop with that error.
    pub async fn run<R, W>(&mut self, input: R, output: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();

        loop {
            write!(output, "Human: ")?;
            output.flush()?;

            let Some(line) = lines.next_line().await? else {
                writeln!(output)?;
                break;
            };
            if line == self.sentinel {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }

            write!(output, "AI: ")?;
            output.flush()?;
            let result = self
                .ask(&line, |fragment| {
                    write!(output, "{fragment}")?;
                    output.flush()?;
                    Ok(())
                })
                .await;

            match result {
                Ok(_) => writeln!(output)?,
                // output itself is broken, nothing left to report to
                Err(ChatmemError::Io(e)) => return Err(ChatmemError::Io(e)),
                Err(e) => {
                    error!("Turn failed: {}", e);
                    writeln!(output)?;
                    writeln!(output, "[error] {e}")?;
                }
            }
        }

        info!("Chat loop finished ({} buffered turns)", self.memory.len());
        Ok(())
    }
}
