//! OpenAI-compatible Chat Completions client
//!
//! Works against api.openai.com and any server speaking the same wire format
//! (Ollama, LM Studio, proxies). Blocking calls and stream setup are retried
//! with exponential backoff; a stream that already started delivering
//! fragments is never retried.

use super::{ChatMessage, ChatModel, StreamEvent};
use crate::{ChatmemConfig, ChatmemError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RETRY_BASE_DELAY_MS: u64 = 200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const STREAM_CHANNEL_CAPACITY: usize = 32;
const MAX_ERROR_DETAIL_CHARS: usize = 500;

/// Chat Completions client
pub struct OpenAiChatModel {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retry_attempts: u32,
}

// ─── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// One parsed `data:` line of the SSE stream
#[derive(Debug, PartialEq, Eq)]
enum SseData {
    Done,
    Chunk {
        content: Option<String>,
        finished: bool,
    },
}

// ─── Implementation ─────────────────────────────────────────────────

impl OpenAiChatModel {
    pub fn new(config: &ChatmemConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("chatmem/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChatmemError::Config(format!("failed to build HTTP client: {e}")))?;

        if config.api_key.is_none() {
            warn!(
                "{} is not set; sending requests without authorization",
                config.api_key_env
            );
        }

        info!(
            "Chat model client: base_url={}, model={}, summary_model={}, attempts={}",
            config.base_url,
            config.model,
            config.effective_summary_model(),
            config.max_retry_attempts
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_retry_attempts: config.max_retry_attempts.max(1),
        })
    }

    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// doubles each time, plus up to 10% deterministic jitter.
    fn retry_backoff(attempt: u32) -> Duration {
        let delay_ms = RETRY_BASE_DELAY_MS << attempt.saturating_sub(1).min(16);
        let jitter_ms = delay_ms * u64::from(attempt % 4) / 30;
        Duration::from_millis(delay_ms + jitter_ms)
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    }

    fn is_retryable_error(err: &ChatmemError) -> bool {
        let ChatmemError::Llm(msg) = err else {
            return false;
        };
        msg.starts_with("timeout")
            || msg.starts_with("network")
            || msg.starts_with("retryable")
    }

    /// Run `op` up to `max_retry_attempts` times while it fails retryably.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if Self::is_retryable_error(&e) && attempt < self.max_retry_attempts => {
                    let delay = Self::retry_backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        what, attempt, self.max_retry_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// POST to /chat/completions and check the status.
    async fn send_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages,
            stream,
        };

        let mut req_builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }
        if stream {
            req_builder = req_builder.header("Accept", "text/event-stream");
        }

        let response = req_builder
            .json(&request)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        Self::check_response_status(response).await
    }

    async fn send_completion(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let response = self.send_request(model, messages, false).await?;

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ChatmemError::Llm(format!("malformed response: {e}")))?;

        chat_response
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ChatmemError::Llm("empty message content".to_string()))
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = Self::error_detail(&body, MAX_ERROR_DETAIL_CHARS);
        let prefix = if Self::is_retryable_status(status) {
            "retryable API error"
        } else {
            "API error"
        };
        if detail.is_empty() {
            Err(ChatmemError::Llm(format!("{prefix} {status}")))
        } else {
            Err(ChatmemError::Llm(format!("{prefix} {status}: {detail}")))
        }
    }

    /// Human-readable part of an error body: the JSON `error.message` or
    /// `message` when present, else the raw body, cut to `max_chars`.
    fn error_detail(body: &str, max_chars: usize) -> String {
        let body = body.trim();
        let value = serde_json::from_str::<serde_json::Value>(body).ok();
        let detail = value
            .as_ref()
            .and_then(|v| {
                v.pointer("/error/message")
                    .or_else(|| v.pointer("/message"))
                    .and_then(|m| m.as_str())
            })
            .unwrap_or(body);

        match detail.char_indices().nth(max_chars) {
            Some((cut, _)) => format!("{}... [truncated]", &detail[..cut]),
            None => detail.to_string(),
        }
    }

    fn map_reqwest_error(e: reqwest::Error) -> ChatmemError {
        if e.is_timeout() {
            ChatmemError::Llm(format!("timeout: {e}"))
        } else if e.is_connect() {
            ChatmemError::Llm(format!("network: {e}"))
        } else {
            ChatmemError::Llm(e.to_string())
        }
    }

    /// Parse one SSE line. Non-data lines and unparseable payloads yield `None`.
    fn parse_sse_line(line: &str) -> Option<SseData> {
        let data = line.strip_prefix("data:")?.trim();
        if data == "[DONE]" {
            return Some(SseData::Done);
        }

        let chunk = serde_json::from_str::<StreamChunk>(data).ok()?;
        let choice = chunk.choices.into_iter().next()?;
        Some(SseData::Chunk {
            content: choice.delta.content,
            finished: choice.finish_reason.is_some(),
        })
    }

    /// Forward SSE events from `response` into `tx` until the stream ends.
    async fn pump_stream(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
        let mut stream = response.bytes_stream();
        // holds a trailing partial line between network chunks; kept as bytes so
        // a multi-byte character split across chunks is decoded whole
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk_result) = stream.next().await {
            let bytes = match chunk_result {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                    return;
                }
            };
            pending.extend_from_slice(&bytes);

            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&raw);
                match Self::parse_sse_line(line.trim_end()) {
                    Some(SseData::Done) => {
                        let _ = tx.send(StreamEvent::Done).await;
                        return;
                    }
                    Some(SseData::Chunk { content, finished }) => {
                        if let Some(content) = content.filter(|c| !c.is_empty()) {
                            if tx.send(StreamEvent::Delta(content)).await.is_err() {
                                debug!("Stream receiver dropped, stopping");
                                return;
                            }
                        }
                        if finished {
                            let _ = tx.send(StreamEvent::Done).await;
                            return;
                        }
                    }
                    None => {}
                }
            }
        }

        // the last line may lack its newline; it still has to finish the reply
        let event = match Self::parse_sse_line(String::from_utf8_lossy(&pending).trim_end()) {
            Some(SseData::Done) => StreamEvent::Done,
            Some(SseData::Chunk {
                content,
                finished: true,
            }) => {
                if let Some(content) = content.filter(|c| !c.is_empty()) {
                    let _ = tx.send(StreamEvent::Delta(content)).await;
                }
                StreamEvent::Done
            }
            _ => {
                warn!("Stream body ended without [DONE] or finish_reason");
                StreamEvent::Error("stream ended before completion".to_string())
            }
        };
        let _ = tx.send(event).await;
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, model: &str, messages: Vec<ChatMessage>) -> Result<String> {
        debug!(
            "Completion request: model={}, messages={}, chars={}",
            model,
            messages.len(),
            messages.iter().map(|m| m.content.len()).sum::<usize>()
        );

        let content = self
            .with_retry("completion request", || self.send_completion(model, &messages))
            .await?;
        debug!("Completion response: {} chars", content.len());
        Ok(content)
    }

    async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        debug!(
            "Streaming request: model={}, messages={}",
            model,
            messages.len()
        );

        let response = self
            .with_retry("streaming request", || {
                self.send_request(model, &messages, true)
            })
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(Self::pump_stream(response, tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::collect_stream;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one streaming response, writing `parts` as separate network
    /// writes, then close the connection. Returns the base URL.
    async fn serve_sse_once(parts: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // read the whole request so closing does not reset the connection
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for part in parts {
                socket.write_all(&part).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            socket.shutdown().await.unwrap();
        });

        format!("http://{addr}")
    }

    fn delta_line(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"delta":{"content":content},"finish_reason":null}]})
        )
    }

    async fn stream_from(parts: Vec<Vec<u8>>) -> Result<String> {
        let mut config = ChatmemConfig::new(PathBuf::from("/tmp"));
        config.base_url = serve_sse_once(parts).await;
        config.max_retry_attempts = 1;
        let model = OpenAiChatModel::new(&config).unwrap();

        let rx = model.stream("test-model", vec![ChatMessage::user("hi")]).await?;
        collect_stream(rx, |_| Ok(())).await
    }

    #[test]
    fn test_parse_sse_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(
            OpenAiChatModel::parse_sse_line(line),
            Some(SseData::Chunk {
                content: Some("Hel".to_string()),
                finished: false,
            })
        );
    }

    #[test]
    fn test_parse_sse_finish_and_done() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(
            OpenAiChatModel::parse_sse_line(line),
            Some(SseData::Chunk {
                content: None,
                finished: true,
            })
        );
        assert_eq!(
            OpenAiChatModel::parse_sse_line("data: [DONE]"),
            Some(SseData::Done)
        );
    }

    #[test]
    fn test_parse_sse_ignores_other_lines() {
        assert_eq!(OpenAiChatModel::parse_sse_line(""), None);
        assert_eq!(OpenAiChatModel::parse_sse_line(": keep-alive"), None);
        assert_eq!(OpenAiChatModel::parse_sse_line("event: message"), None);
        assert_eq!(OpenAiChatModel::parse_sse_line("data: {not json"), None);
    }

    #[test]
    fn test_error_detail() {
        let body = r#"{"error":{"message":"Invalid API key","type":"auth"}}"#;
        assert_eq!(OpenAiChatModel::error_detail(body, 500), "Invalid API key");
        assert_eq!(
            OpenAiChatModel::error_detail(r#"{"message":"overloaded"}"#, 500),
            "overloaded"
        );
        assert_eq!(OpenAiChatModel::error_detail("  bad gateway ", 500), "bad gateway");
        assert_eq!(OpenAiChatModel::error_detail("", 500), "");
    }

    #[test]
    fn test_error_detail_truncates_on_char_boundary() {
        let long = "é".repeat(600);
        let detail = OpenAiChatModel::error_detail(&long, 500);
        assert_eq!(detail, format!("{}... [truncated]", "é".repeat(500)));
        assert_eq!(OpenAiChatModel::error_detail("short", 5), "short");
    }

    #[test]
    fn test_retry_backoff_grows() {
        let first = OpenAiChatModel::retry_backoff(1);
        let second = OpenAiChatModel::retry_backoff(2);
        let third = OpenAiChatModel::retry_backoff(3);
        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OpenAiChatModel::is_retryable_error(&ChatmemError::Llm(
            "timeout: deadline".to_string()
        )));
        assert!(OpenAiChatModel::is_retryable_error(&ChatmemError::Llm(
            "retryable API error 503".to_string()
        )));
        assert!(!OpenAiChatModel::is_retryable_error(&ChatmemError::Llm(
            "API error 401 Unauthorized".to_string()
        )));
        assert!(!OpenAiChatModel::is_retryable_error(
            &ChatmemError::InvalidArgument("x".to_string())
        ));
        assert!(OpenAiChatModel::is_retryable_status(
            reqwest::StatusCode::BAD_GATEWAY
        ));
        assert!(!OpenAiChatModel::is_retryable_status(
            reqwest::StatusCode::BAD_REQUEST
        ));
    }

    #[tokio::test]
    async fn test_with_retry_stops_after_max_attempts() {
        let mut config = ChatmemConfig::new(PathBuf::from("/tmp"));
        config.max_retry_attempts = 2;
        let model = OpenAiChatModel::new(&config).unwrap();

        let mut calls = 0;
        let result: Result<()> = model
            .with_retry("test", || {
                calls += 1;
                async { Err(ChatmemError::Llm("network: refused".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_fatal_errors() {
        let config = ChatmemConfig::new(PathBuf::from("/tmp"));
        let model = OpenAiChatModel::new(&config).unwrap();

        let mut calls = 0;
        let result: Result<()> = model
            .with_retry("test", || {
                calls += 1;
                async { Err(ChatmemError::Llm("API error 400".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_stream_reassembles_lines_split_across_chunks() {
        let first = delta_line("Hel");
        let second = delta_line("lo");
        let (head, tail) = second.split_at(12);
        let reply = stream_from(vec![
            format!("{first}{head}").into_bytes(),
            format!("{tail}data: [DONE]\n\n").into_bytes(),
        ])
        .await
        .unwrap();
        assert_eq!(reply, "Hello");
    }

    #[tokio::test]
    async fn test_stream_decodes_multibyte_char_split_across_chunks() {
        let line = delta_line("café").into_bytes();
        // split inside the two-byte encoding of 'é'
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let reply = stream_from(vec![
            line[..split].to_vec(),
            line[split..].to_vec(),
            b"data: [DONE]\n\n".to_vec(),
        ])
        .await
        .unwrap();
        assert_eq!(reply, "café");
    }

    #[tokio::test]
    async fn test_stream_finishes_on_finish_reason() {
        let finish = r#"data: {"choices":[{"delta":{"content":"!"},"finish_reason":"stop"}]}"#;
        let reply = stream_from(vec![
            delta_line("Done").into_bytes(),
            format!("{finish}\n\n").into_bytes(),
        ])
        .await
        .unwrap();
        assert_eq!(reply, "Done!");
    }

    #[tokio::test]
    async fn test_stream_accepts_done_without_trailing_newline() {
        let reply = stream_from(vec![
            delta_line("ok").into_bytes(),
            b"data: [DONE]".to_vec(),
        ])
        .await
        .unwrap();
        assert_eq!(reply, "ok");
    }

    #[tokio::test]
    async fn test_stream_cut_before_completion_is_an_error() {
        let result = stream_from(vec![delta_line("The answer is").into_bytes()]).await;
        assert!(matches!(result, Err(ChatmemError::Llm(_))));
    }
}
