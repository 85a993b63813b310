//! Summarization step: fold an evicted turn into the running summary.

use crate::llm::{ChatMessage, ChatModel};
use crate::{ChatmemError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Instructions sent ahead of the current summary and the evicted turn.
pub const SUMMARY_INSTRUCTIONS: &str = r#"You are a powerful chatbot. Please summarize the conversation content provided by the user,
add it to the previously provided summary, and return a new summary. Do not generate any data except the new summary.
If the user's conversation includes key information such as names, gender, locations, dates, important events, etc., be sure to include them in the new summary.
The summary should aim to preserve the user's conversation details as accurately as possible.

<example>
Current Summary: Humans ask AI about AI's perspective on artificial intelligence, and AI believes AI is a force for good.

New Conversation:
Human: Why do you think artificial intelligence is a force for good?
AI: Because artificial intelligence will help humans reach their full potential.

New Summary: Humans ask AI about AI's perspective on artificial intelligence, and AI believes AI is a force for good because it will help humans fully realize their potential.
</example>"#;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think-block regex"));

/// Produces a new summary from the previous one plus newly evicted lines.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(&self, current_summary: &str, new_lines: &str) -> Result<String>;
}

/// Summarizer backed by a chat model's blocking completion call
pub struct LlmSummarizer {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl LlmSummarizer {
    pub fn new(model: Arc<dyn ChatModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

/// Build the full summarization prompt.
pub fn build_summary_prompt(current_summary: &str, new_lines: &str) -> String {
    format!(
        "{SUMMARY_INSTRUCTIONS}\n\n\
         ===================== Below is the actual data to be processed =====================\n\n\
         Current Summary: {current_summary}\n\n\
         New Conversation:\n{new_lines}\n\n\
         Please generate a new summary for the user based on the above information."
    )
}

/// Drop `<think>...</think>` blocks some reasoning models prepend.
pub fn strip_think_blocks(content: &str) -> String {
    THINK_BLOCK.replace_all(content, "").trim().to_string()
}

#[async_trait]
impl Summarize for LlmSummarizer {
    async fn summarize(&self, current_summary: &str, new_lines: &str) -> Result<String> {
        let prompt = build_summary_prompt(current_summary, new_lines);
        debug!("Summary prompt length: {}", prompt.len());

        let raw = self
            .model
            .complete(&self.model_name, vec![ChatMessage::user(prompt)])
            .await?;

        let summary = strip_think_blocks(&raw);
        if summary.is_empty() {
            return Err(ChatmemError::Llm(
                "summarizer returned an empty summary".to_string(),
            ));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StreamEvent;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records prompts and answers with a canned reply
    struct CannedModel {
        reply: String,
        prompts: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    }

    #[async_trait]
    impl ChatModel for CannedModel {
        async fn complete(&self, model: &str, messages: Vec<ChatMessage>) -> Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push((model.to_string(), messages));
            Ok(self.reply.clone())
        }

        async fn stream(
            &self,
            _model: &str,
            _messages: Vec<ChatMessage>,
        ) -> Result<mpsc::Receiver<StreamEvent>> {
            Err(ChatmemError::Llm("not used".to_string()))
        }
    }

    fn canned(reply: &str) -> Arc<CannedModel> {
        Arc::new(CannedModel {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_prompt_embeds_summary_and_turn() {
        let prompt = build_summary_prompt("Ling lives in Guangzhou.", "Human:Hi\nAI:Hello!");
        assert!(prompt.starts_with(SUMMARY_INSTRUCTIONS));
        assert!(prompt.contains("Current Summary: Ling lives in Guangzhou.\n"));
        assert!(prompt.contains("New Conversation:\nHuman:Hi\nAI:Hello!\n"));
    }

    #[test]
    fn test_strip_think_blocks() {
        assert_eq!(
            strip_think_blocks("<think>\nlet me see\n</think>\nThe user is Ling."),
            "The user is Ling."
        );
        assert_eq!(strip_think_blocks("  plain  "), "plain");
    }

    #[tokio::test]
    async fn test_llm_summarizer_uses_summary_model() {
        let model = canned("  Ling introduced themself.  ");
        let summarizer = LlmSummarizer::new(model.clone(), "summary-model");

        let summary = summarizer
            .summarize("", "Human:I'm Ling\nAI:Nice to meet you")
            .await
            .unwrap();
        assert_eq!(summary, "Ling introduced themself.");

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, "summary-model");
        assert_eq!(prompts[0].1.len(), 1);
        assert!(prompts[0].1[0].content.contains("Human:I'm Ling"));
    }

    #[tokio::test]
    async fn test_llm_summarizer_rejects_empty_output() {
        let summarizer = LlmSummarizer::new(canned("<think>hmm</think>"), "m");
        let err = summarizer.summarize("old", "Human:a\nAI:b").await.unwrap_err();
        assert!(matches!(err, ChatmemError::Llm(_)));
    }
}
