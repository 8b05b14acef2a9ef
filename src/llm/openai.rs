use super::*;
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionStreamResponse, FinishReason,
    },
    Client,
};
use futures::StreamExt;

use crate::types::TurnRole;

/// OpenAI chat-completions streaming backend
pub struct OpenAiProvider {
    client: Option<Client<OpenAIConfig>>,
    model: String,
    default_max_tokens: Option<u32>,
}

impl OpenAiProvider {
    /// Create a new OpenAI provider. Without an API key the provider stays unconfigured.
    pub fn new(api_key: Option<String>, model: String, default_max_tokens: Option<u32>) -> Self {
        let client = api_key.map(|key| Client::with_config(OpenAIConfig::new().with_api_key(key)));

        Self {
            client,
            model,
            default_max_tokens,
        }
    }

    fn build_request(&self, request: &CompletionRequest) -> LlmResult<CreateChatCompletionRequest> {
        let api_err = |e: OpenAIError| LlmError::ApiError(e.to_string());

        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.as_str())
                    .build()
                    .map_err(api_err)?
                    .into(),
            );
        }

        for turn in &request.messages {
            let message: ChatCompletionRequestMessage = match turn.role {
                TurnRole::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()
                    .map_err(api_err)?
                    .into(),
                TurnRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()
                    .map_err(api_err)?
                    .into(),
                TurnRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()
                    .map_err(api_err)?
                    .into(),
            };
            messages.push(message);
        }

        let mut req_builder = CreateChatCompletionRequestArgs::default();
        req_builder.model(&request.model).messages(messages);

        if let Some(temperature) = request.temperature {
            req_builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_output_length.or(self.default_max_tokens) {
            req_builder.max_completion_tokens(max_tokens);
        }

        req_builder.build().map_err(api_err)
    }
}

fn finish_reason_name(reason: &FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::FunctionCall => "function_call",
    }
}

/// Split one streamed response into content fragments and an optional terminal event
fn convert_chunk(response: CreateChatCompletionStreamResponse) -> Vec<LlmResult<StreamEvent>> {
    let mut events = Vec::new();
    for choice in response.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(Ok(StreamEvent::Content(content)));
            }
        }
        if let Some(reason) = choice.finish_reason {
            events.push(Ok(StreamEvent::Finished {
                finish_reason: finish_reason_name(&reason).to_string(),
            }));
        }
    }
    events
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LlmResult<CompletionStream> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| LlmError::NotConfigured(self.name().to_string()))?;

        let chat_request = self.build_request(&request)?;
        tracing::debug!("Opening OpenAI stream for model {}", request.model);

        let upstream = client
            .chat()
            .create_stream(chat_request)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let stream = upstream
            .take_until(cancel.cancelled_owned())
            .flat_map(|item| {
                let events = match item {
                    Ok(response) => convert_chunk(response),
                    Err(e) => vec![Err(LlmError::ApiError(e.to_string()))],
                };
                futures::stream::iter(events)
            });

        Ok(stream.boxed())
    }
}
