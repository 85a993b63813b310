//! Memory module for Chatmem
//!
//! Provides the summary-buffer memory, the summarization step, and
//! per-session persistence.

mod session_store;
mod summarize;
mod summary_buffer;

pub use session_store::{SessionSnapshot, SessionStore};
pub use summarize::{
    build_summary_prompt, strip_think_blocks, LlmSummarizer, Summarize, SUMMARY_INSTRUCTIONS,
};
pub use summary_buffer::{
    ConversationMemory, ConversationTurn, MemoryContext, MemoryOptions, MemorySnapshot,
    TokenMeasure, DEFAULT_MAX_SIZE_TOKENS,
};
