use super::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::types::TurnRole;

/// Ollama `/api/chat` streaming backend
pub struct OllamaProvider {
    base_url: Option<String>,
    model: String,
    default_max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OllamaProvider {
    /// Create a new Ollama provider. Without a base URL the provider stays unconfigured.
    pub fn new(
        base_url: Option<String>,
        model: String,
        default_max_tokens: Option<u32>,
    ) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            model,
            default_max_tokens,
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    think: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

fn role_name(role: TurnRole) -> &'static str {
    match role {
        TurnRole::System => "system",
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
    }
}

/// Parse one NDJSON line of an `/api/chat` stream
fn parse_chat_line(line: &[u8]) -> LlmResult<Vec<StreamEvent>> {
    let chunk: OllamaChatChunk =
        serde_json::from_slice(line).map_err(|e| LlmError::ParseError(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(LlmError::ApiError(error));
    }

    let mut events = Vec::new();
    if let Some(message) = chunk.message {
        if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::Reasoning(thinking));
        }
        if !message.content.is_empty() {
            events.push(StreamEvent::Content(message.content));
        }
    }
    if chunk.done {
        events.push(StreamEvent::Finished {
            finish_reason: chunk.done_reason.unwrap_or_else(|| "stop".to_string()),
        });
    }
    Ok(events)
}

/// Incremental NDJSON decoder over a byte stream
struct LineReader {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl LineReader {
    async fn next_event(&mut self) -> Option<LlmResult<StreamEvent>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                if matches!(event, StreamEvent::Finished { .. }) {
                    self.finished = true;
                }
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                match parse_chat_line(line) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
                continue;
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = self.body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(LlmError::ApiError(e.to_string())));
                }
                None if !self.buffer.is_empty() => self.buffer.push(b'\n'),
                None => {
                    self.finished = true;
                    return Some(Err(LlmError::Truncated));
                }
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LlmResult<CompletionStream> {
        let base_url = self
            .base_url
            .as_ref()
            .ok_or_else(|| LlmError::NotConfigured(self.name().to_string()))?;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(OllamaMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|turn| OllamaMessage {
            role: role_name(turn.role),
            content: &turn.content,
        }));

        let num_predict = request.max_output_length.or(self.default_max_tokens);
        let options = (request.temperature.is_some() || num_predict.is_some()).then_some(
            OllamaOptions {
                temperature: request.temperature,
                num_predict,
            },
        );

        let ollama_request = OllamaChatRequest {
            model: &request.model,
            messages,
            stream: true,
            think: request.reasoning,
            options,
        };

        let url = format!("{}/api/chat", base_url);
        tracing::debug!("Opening Ollama stream at {} for model {}", url, request.model);

        let response = self
            .client
            .post(&url)
            .json(&ollama_request)
            .send()
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::ApiError(format!(
                "Ollama API returned status: {}",
                response.status()
            )));
        }

        let reader = LineReader {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            cancel,
            finished: false,
        };

        let stream = futures::stream::unfold(reader, |mut reader| async move {
            let event = reader.next_event().await?;
            Some((event, reader))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_over(chunks: Vec<&'static str>, cancel: CancellationToken) -> LineReader {
        let body = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(c.as_bytes().to_vec())),
        )
        .boxed();
        LineReader {
            body,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            cancel,
            finished: false,
        }
    }

    #[test]
    fn test_parse_chat_line() {
        let events = parse_chat_line(
            br#"{"message":{"role":"assistant","content":"Hi","thinking":"hmm"},"done":false}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Reasoning("hmm".to_string()),
                StreamEvent::Content("Hi".to_string())
            ]
        );

        let events =
            parse_chat_line(br#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"length"}"#)
                .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Finished {
                finish_reason: "length".to_string()
            }]
        );

        assert!(matches!(
            parse_chat_line(br#"{"error":"model not found"}"#),
            Err(LlmError::ApiError(_))
        ));
        assert!(matches!(
            parse_chat_line(b"{oops"),
            Err(LlmError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_line_reader_handles_split_frames() {
        let mut reader = reader_over(
            vec![
                "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"message\":",
                "{\"content\":\"lo\"},\"done\":false}\n",
                "{\"done\":true}",
            ],
            CancellationToken::new(),
        );

        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await {
            events.push(event.unwrap());
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::Content("Hel".to_string()),
                StreamEvent::Content("lo".to_string()),
                StreamEvent::Finished {
                    finish_reason: "stop".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_line_reader_reports_truncation() {
        let mut reader = reader_over(
            vec!["{\"message\":{\"content\":\"Hel\"},\"done\":false}\n"],
            CancellationToken::new(),
        );
        assert!(matches!(reader.next_event().await, Some(Ok(StreamEvent::Content(_)))));
        assert!(matches!(reader.next_event().await, Some(Err(LlmError::Truncated))));
        assert!(reader.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_line_reader_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let mut reader = reader_over(
            vec!["{\"message\":{\"content\":\"Hel\"},\"done\":false}\n"],
            cancel.clone(),
        );
        cancel.cancel();
        assert!(reader.next_event().await.is_none());
    }

    #[tokio::test]
    #[ignore] // Only run with Ollama running locally
    async fn test_ollama_stream() {
        let provider = OllamaProvider::new(
            Some("http://localhost:11434".to_string()),
            "llama3.2".to_string(),
            None,
        )
        .unwrap();

        let request = CompletionRequest {
            model: "llama3.2".to_string(),
            messages: vec![ChatTurn::user("Say hello in three words.")],
            system_prompt: None,
            temperature: None,
            max_output_length: Some(20),
            reasoning: false,
        };

        let mut stream = provider
            .stream(request, CancellationToken::new())
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::Content(fragment) = event.unwrap() {
                text.push_str(&fragment);
            }
        }
        assert!(!text.is_empty());
    }
}
