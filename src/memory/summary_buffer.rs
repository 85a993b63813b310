//! Summary-buffer conversation memory.
//!
//! Recent turns stay verbatim in a buffer. When the rendered buffer grows past
//! `max_size_tokens`, the oldest turn is folded into a rolling summary by the
//! summarizer and dropped from the buffer:
//!
//!   save_context(h, a)
//!     -> push (h, a)
//!     -> measure(render_buffer()) > max ?
//!          yes: summary = summarize(summary, oldest); pop oldest
//!
//! By default at most one turn is evicted per `save_context`, which bounds the
//! number of summarizer calls per turn. `evict_until_under_threshold` keeps
//! evicting until the buffer fits or only one turn is left.

use super::summarize::Summarize;
use crate::{ChatmemError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Approximate bytes per token for `TokenMeasure::ApproxTokens`
const APPROX_BYTES_PER_TOKEN: usize = 4;

/// Default buffer threshold
pub const DEFAULT_MAX_SIZE_TOKENS: usize = 300;

/// How buffer size is measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMeasure {
    /// Number of characters
    #[default]
    Chars,
    /// Byte length / 4
    ApproxTokens,
}

impl TokenMeasure {
    pub fn measure(&self, text: &str) -> usize {
        match self {
            Self::Chars => text.chars().count(),
            Self::ApproxTokens => text.len().div_ceil(APPROX_BYTES_PER_TOKEN),
        }
    }
}

impl FromStr for TokenMeasure {
    type Err = ChatmemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chars" => Ok(Self::Chars),
            "approx_tokens" | "approx-tokens" => Ok(Self::ApproxTokens),
            other => Err(ChatmemError::InvalidArgument(format!(
                "unknown measure '{other}', expected 'chars' or 'approx_tokens'"
            ))),
        }
    }
}

impl fmt::Display for TokenMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chars => write!(f, "chars"),
            Self::ApproxTokens => write!(f, "approx_tokens"),
        }
    }
}

/// Buffer threshold and eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOptions {
    pub max_size_tokens: usize,
    pub evict_until_under_threshold: bool,
    pub measure: TokenMeasure,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            max_size_tokens: DEFAULT_MAX_SIZE_TOKENS,
            evict_until_under_threshold: false,
            measure: TokenMeasure::Chars,
        }
    }
}

impl MemoryOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_size_tokens == 0 {
            return Err(ChatmemError::InvalidArgument(
                "max_size_tokens must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One human utterance and the reply it got
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub human_text: String,
    pub ai_text: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(human_text: impl Into<String>, ai_text: impl Into<String>) -> Self {
        Self {
            human_text: human_text.into(),
            ai_text: ai_text.into(),
            created_at: Utc::now(),
        }
    }

    /// `Human:<human>\nAI:<ai>`
    pub fn to_prompt_string(&self) -> String {
        format!("Human:{}\nAI:{}", self.human_text, self.ai_text)
    }
}

/// Memory variables handed to the reply prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryContext {
    pub summary_block: String,
}

/// Serializable copy of the memory state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub summary: String,
    pub turns: Vec<ConversationTurn>,
}

/// Summary-buffer memory for one conversation
pub struct ConversationMemory {
    summary: String,
    /// Oldest first
    buffer: VecDeque<ConversationTurn>,
    options: MemoryOptions,
    summarizer: Arc<dyn Summarize>,
}

impl fmt::Debug for ConversationMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationMemory")
            .field("summary", &self.summary)
            .field("buffer", &self.buffer)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConversationMemory {
    /// Create an empty memory. Fails if `options` are unusable.
    pub fn new(summarizer: Arc<dyn Summarize>, options: MemoryOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            summary: String::new(),
            buffer: VecDeque::new(),
            options,
            summarizer,
        })
    }

    pub fn measure(&self, text: &str) -> usize {
        self.options.measure.measure(text)
    }

    /// Render buffered turns oldest first, separated by blank lines.
    pub fn render_buffer(&self) -> String {
        self.buffer
            .iter()
            .map(ConversationTurn::to_prompt_string)
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string()
    }

    pub fn load_context(&self) -> MemoryContext {
        MemoryContext {
            summary_block: format!(
                "Summary:{}\n\nHistorical Info:{}\n",
                self.summary,
                self.render_buffer()
            ),
        }
    }

    /// Current measured size of the rendered buffer
    pub fn buffer_size(&self) -> usize {
        self.measure(&self.render_buffer())
    }

    /// Record a completed round trip and evict if the buffer is over budget.
    ///
    /// If the summarizer fails the error is returned, the new turn stays in
    /// the buffer, and neither the summary nor the oldest turn is touched.
    pub async fn save_context(&mut self, human_text: &str, ai_text: &str) -> Result<()> {
        self.buffer
            .push_back(ConversationTurn::new(human_text, ai_text));

        loop {
            let size = self.buffer_size();
            debug!(
                "Buffer size {} / {} ({} turns)",
                size,
                self.options.max_size_tokens,
                self.buffer.len()
            );
            if size <= self.options.max_size_tokens {
                break;
            }

            self.evict_oldest().await?;

            if !self.options.evict_until_under_threshold || self.buffer.len() <= 1 {
                break;
            }
        }

        Ok(())
    }

    /// Fold the oldest turn into the summary, then drop it.
    async fn evict_oldest(&mut self) -> Result<()> {
        let Some(oldest) = self.buffer.front() else {
            return Ok(());
        };

        info!("Generating new summary");
        let summary = self
            .summarizer
            .summarize(&self.summary, &oldest.to_prompt_string())
            .await?;
        info!("New summary generated ({} chars)", summary.chars().count());

        self.summary = summary;
        self.buffer.pop_front();
        Ok(())
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Buffered turns, oldest first
    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.options
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            summary: self.summary.clone(),
            turns: self.buffer.iter().cloned().collect(),
        }
    }

    /// Replace the state with a snapshot. The threshold is re-checked on the
    /// next `save_context`, not here.
    pub fn restore(&mut self, snapshot: MemorySnapshot) {
        self.summary = snapshot.summary;
        self.buffer = snapshot.turns.into();
    }
}
