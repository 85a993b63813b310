//! Chatmem - summary-buffer conversation memory
//!
//! Keeps a chat session's context under a token budget:
//! - Recent turns are kept verbatim in a buffer
//! - Turns that overflow the buffer are folded into a rolling summary by the LLM
//! - Replies are streamed from an OpenAI-compatible chat endpoint

pub mod chat;
pub mod config;
pub mod llm;
pub mod memory;

pub use chat::ChatSession;
pub use config::ChatmemConfig;
pub use llm::{ChatMessage, ChatModel, ChatRole, OpenAiChatModel, StreamEvent};
pub use memory::{
    ConversationMemory, ConversationTurn, LlmSummarizer, MemoryOptions, SessionStore, Summarize,
    TokenMeasure,
};

/// Result type for Chatmem operations
pub type Result<T> = std::result::Result<T, ChatmemError>;

/// Errors that can occur in Chatmem
#[derive(Debug, thiserror::Error)]
pub enum ChatmemError {
    /// The chat model failed: network, HTTP status, malformed or empty output
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
