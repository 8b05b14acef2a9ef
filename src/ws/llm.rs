//! `llm` domain: streaming completion tasks
//!
//! Each `llm:start` spawns one runner task that forwards provider output to the
//! owning connection until the stream finishes, fails, times out or the task's
//! cancellation token is set. The runner never emits anything for a task that
//! is no longer in the connection's task map.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::handlers::{panic_message, DomainHandler, HandlerError};
use crate::llm::{CompletionRequest, LlmError, LlmManager, LlmProvider, StreamEvent};
use crate::protocol::{DomainEvent, Envelope, ErrorCode, ErrorDetails, EventBody, Outbound};
use crate::state::{ActiveTask, Connection, InsertTaskError};
use crate::telemetry::{TaskOutcome, TelemetryRecord, TelemetrySink};
use crate::types::{ChatTurn, TaskId};

const DOMAIN: &str = "llm";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    task_id: Option<TaskId>,
    model: Option<String>,
    backend: Option<String>,
    #[serde(default)]
    messages: Vec<ChatTurn>,
    content: Option<String>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_output_length: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    task_id: TaskId,
}

fn event(task_id: Option<TaskId>, body: EventBody) -> Outbound {
    DomainEvent::new(DOMAIN, task_id, body).into()
}

fn cancelled_event(task: &ActiveTask) -> Option<Outbound> {
    Some(event(
        Some(task.id.clone()),
        EventBody::Cancelled {
            partial_content: task.content.clone(),
            chunk_count: task.sequence,
        },
    ))
}

fn rejected(code: ErrorCode, message: impl Into<String>) -> HandlerError {
    HandlerError::Rejected(ErrorDetails::new(code, message))
}

pub struct LlmHandler {
    llm: Arc<LlmManager>,
    telemetry: Arc<dyn TelemetrySink>,
    max_tasks: usize,
    timeout: Duration,
}

impl LlmHandler {
    pub fn new(
        llm: Arc<LlmManager>,
        telemetry: Arc<dyn TelemetrySink>,
        max_tasks: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            telemetry,
            max_tasks,
            timeout,
        }
    }

    fn record(&self, conn: &Connection, task: &ActiveTask, outcome: TaskOutcome) {
        record_task(self.telemetry.as_ref(), conn, task, outcome);
    }

    /// Pick the backend that will serve a request
    fn resolve_backend(&self, request: &StartRequest) -> Result<String, HandlerError> {
        if let Some(backend) = &request.backend {
            return Ok(backend.clone());
        }
        if let Some(model) = &request.model {
            return match self.llm.models.lookup(model) {
                Some(entry) => Ok(entry.backend.clone()),
                None => Err(HandlerError::Rejected(
                    ErrorDetails::new(ErrorCode::UnknownModel, format!("Unknown model '{}'", model))
                        .with_available_providers(self.llm.available()),
                )),
            };
        }
        self.llm.available().into_iter().next().ok_or_else(|| {
            rejected(
                ErrorCode::ProviderNotConfigured,
                "No LLM provider is configured",
            )
        })
    }

    async fn start(&self, conn: &Arc<Connection>, envelope: &Envelope) -> Result<(), HandlerError> {
        if conn.active_task_count() >= self.max_tasks {
            return Err(rejected(
                ErrorCode::TooManyTasks,
                format!("At most {} concurrent tasks per connection", self.max_tasks),
            ));
        }

        let request: StartRequest = envelope.decode()?;

        let content = request
            .content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        if request.messages.is_empty() && content.is_none() {
            return Err(HandlerError::InvalidRequest(
                "Either a non-empty `messages` list or `content` is required".to_string(),
            ));
        }
        if request.messages.iter().any(|m| m.content.is_empty()) {
            return Err(HandlerError::InvalidRequest(
                "Message content must not be empty".to_string(),
            ));
        }

        if let Some(task_id) = &request.task_id {
            if conn.has_task(task_id) {
                return Err(rejected(
                    ErrorCode::DuplicateTask,
                    format!("Task '{}' is already active", task_id),
                ));
            }
        }

        let backend = self.resolve_backend(&request)?;
        let provider = self.llm.configured(&backend).map_err(|_| {
            HandlerError::Rejected(
                ErrorDetails::new(
                    ErrorCode::ProviderNotConfigured,
                    format!("Provider '{}' is not configured", backend),
                )
                .with_available_providers(self.llm.available()),
            )
        })?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());
        let supports_reasoning = self.llm.models.supports_reasoning(&backend, &model);

        // Content-only requests continue the connection's running conversation
        let content_mode = request.messages.is_empty();
        let messages = if content_mode {
            let mut turns = conn.history();
            if let Some(content) = &content {
                turns.push(ChatTurn::user(content.clone()));
            }
            turns
        } else {
            request.messages
        };

        let task_id = request
            .task_id
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        let task = ActiveTask::new(task_id.clone(), backend.clone(), model.clone());
        let cancel = task.cancel.clone();

        conn.insert_task(task, self.max_tasks).map_err(|e| match e {
            InsertTaskError::AtCapacity => rejected(
                ErrorCode::TooManyTasks,
                format!("At most {} concurrent tasks per connection", self.max_tasks),
            ),
            InsertTaskError::Duplicate => rejected(
                ErrorCode::DuplicateTask,
                format!("Task '{}' is already active", task_id),
            ),
        })?;

        conn.send(event(
            Some(task_id.clone()),
            EventBody::Started {
                backend: backend.clone(),
                model: model.clone(),
                supports_reasoning,
                timeout_ms: self.timeout.as_millis() as u64,
            },
        ));
        tracing::info!(
            "Task {} started for connection {} ({}/{})",
            task_id,
            conn.id,
            backend,
            model
        );

        let completion = CompletionRequest {
            model,
            messages,
            system_prompt: request.system_prompt,
            temperature: request.temperature,
            max_output_length: request.max_output_length,
            reasoning: supports_reasoning,
        };

        let runner = TaskRunner {
            conn: conn.clone(),
            task_id,
            cancel,
            timeout: self.timeout,
            telemetry: self.telemetry.clone(),
            user_turn: if content_mode { content } else { None },
        };
        tokio::spawn(runner.run(provider, completion));

        Ok(())
    }

    fn cancel(&self, conn: &Arc<Connection>, envelope: &Envelope) -> Result<(), HandlerError> {
        let request: CancelRequest = envelope.decode()?;

        match conn.finish_task(&request.task_id, cancelled_event) {
            Some(task) => {
                tracing::info!("Task {} cancelled by {}", task.id, conn.id);
                self.record(conn, &task, TaskOutcome::Cancelled);
                Ok(())
            }
            None => Err(rejected(
                ErrorCode::TaskNotFound,
                format!("Task '{}' is not active", request.task_id),
            )),
        }
    }

    fn cancel_all(&self, conn: &Arc<Connection>) {
        let cancelled = conn.finish_all_tasks(cancelled_event);
        for task in &cancelled {
            self.record(conn, task, TaskOutcome::Cancelled);
        }
        let task_ids: Vec<TaskId> = cancelled.into_iter().map(|t| t.id).collect();
        tracing::info!("Cancelled {} task(s) for {}", task_ids.len(), conn.id);
        conn.send(event(None, EventBody::CancelledAll { task_ids }));
    }
}

fn record_task(
    telemetry: &dyn TelemetrySink,
    conn: &Connection,
    task: &ActiveTask,
    outcome: TaskOutcome,
) {
    telemetry.record(TelemetryRecord::TaskFinished {
        connection_id: conn.id.clone(),
        task_id: task.id.clone(),
        backend: task.backend.clone(),
        model: task.model.clone(),
        outcome,
        chunks: task.sequence,
        duration_ms: task.elapsed_ms(),
    });
}

#[async_trait]
impl DomainHandler for LlmHandler {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    async fn handle(
        &self,
        conn: &Arc<Connection>,
        action: &str,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        match action {
            "start" => self.start(conn, envelope).await,
            "cancel" => self.cancel(conn, envelope),
            "cancel_all" => {
                self.cancel_all(conn);
                Ok(())
            }
            "providers" => {
                conn.send(event(
                    None,
                    EventBody::Providers {
                        providers: self.llm.provider_info(),
                    },
                ));
                Ok(())
            }
            "models" => {
                conn.send(event(
                    None,
                    EventBody::Models {
                        models: self.llm.model_info(),
                    },
                ));
                Ok(())
            }
            "clear" => {
                let turns = conn.clear_history();
                conn.send(event(None, EventBody::HistoryCleared { turns }));
                Ok(())
            }
            other => Err(HandlerError::UnknownAction(other.to_string())),
        }
    }
}

enum RunOutcome {
    Finished(String),
    /// The task left the map while streaming (cancelled elsewhere)
    Gone,
    TimedOut,
    Failed(LlmError),
}

/// Drives one task's provider stream to a terminal state
struct TaskRunner {
    conn: Arc<Connection>,
    task_id: TaskId,
    cancel: CancellationToken,
    timeout: Duration,
    telemetry: Arc<dyn TelemetrySink>,
    /// User content to record in the history ring on success
    user_turn: Option<String>,
}

impl TaskRunner {
    async fn run(self, provider: Arc<dyn LlmProvider>, request: CompletionRequest) {
        let outcome = tokio::select! {
            biased;
            // Whoever set the token already removed the task and emitted its terminal event
            _ = self.cancel.cancelled() => RunOutcome::Gone,
            _ = tokio::time::sleep(self.timeout) => RunOutcome::TimedOut,
            outcome = AssertUnwindSafe(self.pump(provider, request)).catch_unwind() => {
                outcome.unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    tracing::error!("Runner for task {} panicked: {}", self.task_id, message);
                    RunOutcome::Failed(LlmError::ApiError(format!(
                        "Provider panicked: {}",
                        message
                    )))
                })
            }
        };
        self.finish(outcome);
    }

    async fn pump(&self, provider: Arc<dyn LlmProvider>, request: CompletionRequest) -> RunOutcome {
        let mut stream = match provider.stream(request, self.cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => return RunOutcome::Failed(e),
        };

        while let Some(item) = stream.next().await {
            let forwarded = match item {
                Ok(StreamEvent::Content(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.conn.with_task(&self.task_id, |task| {
                        task.sequence += 1;
                        task.content.push_str(&text);
                        Some(event(
                            Some(task.id.clone()),
                            EventBody::Chunk {
                                content: text,
                                sequence: task.sequence,
                            },
                        ))
                    })
                }
                Ok(StreamEvent::Reasoning(text)) => self.conn.with_task(&self.task_id, |task| {
                    Some(event(
                        Some(task.id.clone()),
                        EventBody::Thinking { content: text },
                    ))
                }),
                Ok(StreamEvent::Finished { finish_reason }) => {
                    return RunOutcome::Finished(finish_reason)
                }
                Err(e) => return RunOutcome::Failed(e),
            };
            if !forwarded {
                return RunOutcome::Gone;
            }
        }

        RunOutcome::Failed(LlmError::Truncated)
    }

    fn finish(self, outcome: RunOutcome) {
        let conn = &self.conn;
        match outcome {
            RunOutcome::Gone => {}
            RunOutcome::Finished(finish_reason) => {
                let Some(task) = conn.finish_task(&self.task_id, |task| {
                    Some(event(
                        Some(task.id.clone()),
                        EventBody::Done {
                            chunk_count: task.sequence,
                            content_length: task.content.chars().count(),
                            finish_reason,
                            duration_ms: task.elapsed_ms(),
                        },
                    ))
                }) else {
                    return;
                };
                if let Some(user_turn) = self.user_turn {
                    conn.push_history([
                        ChatTurn::user(user_turn),
                        ChatTurn::assistant(task.content.clone()),
                    ]);
                }
                tracing::info!(
                    "Task {} done: {} chunk(s) in {}ms",
                    task.id,
                    task.sequence,
                    task.elapsed_ms()
                );
                record_task(self.telemetry.as_ref(), conn, &task, TaskOutcome::Done);
            }
            RunOutcome::TimedOut => {
                let timeout_ms = self.timeout.as_millis();
                let Some(task) = conn.finish_task(&self.task_id, |task| {
                    Some(
                        DomainEvent::error(
                            DOMAIN,
                            Some(task.id.clone()),
                            ErrorDetails::new(
                                ErrorCode::Timeout,
                                format!("Task exceeded the {}ms time limit", timeout_ms),
                            )
                            .with_target(&task.backend, &task.model),
                        )
                        .into(),
                    )
                }) else {
                    return;
                };
                tracing::warn!("Task {} timed out after {}ms", task.id, timeout_ms);
                record_task(self.telemetry.as_ref(), conn, &task, TaskOutcome::Timeout);
            }
            RunOutcome::Failed(e) => {
                // Cancellation wins over a late provider error
                if self.cancel.is_cancelled() {
                    return;
                }
                let message = e.to_string();
                let Some(task) = conn.finish_task(&self.task_id, |task| {
                    Some(
                        DomainEvent::error(
                            DOMAIN,
                            Some(task.id.clone()),
                            ErrorDetails::new(ErrorCode::ProviderError, message.clone())
                                .with_target(&task.backend, &task.model),
                        )
                        .into(),
                    )
                }) else {
                    return;
                };
                tracing::warn!("Task {} failed: {}", task.id, message);
                record_task(self.telemetry.as_ref(), conn, &task, TaskOutcome::Error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionStream, LlmResult, ModelRegistry};
    use crate::state::Outgoing;
    use crate::telemetry::TracingTelemetry;
    use tokio::sync::mpsc;

    /// Provider that replays a fixed script
    struct Scripted {
        events: Vec<StreamEvent>,
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn default_model(&self) -> &str {
            "script-1"
        }

        async fn stream(
            &self,
            _request: CompletionRequest,
            _cancel: CancellationToken,
        ) -> LlmResult<CompletionStream> {
            let items: Vec<LlmResult<StreamEvent>> =
                self.events.iter().cloned().map(Ok).collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    fn handler(events: Vec<StreamEvent>) -> LlmHandler {
        let mut models = ModelRegistry::new();
        models.register("script-1", "scripted", false);
        LlmHandler::new(
            Arc::new(LlmManager::new(vec![Arc::new(Scripted { events })], models)),
            Arc::new(TracingTelemetry),
            2,
            Duration::from_secs(5),
        )
    }

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new("c1".to_string(), None, tx, 10)), rx)
    }

    fn envelope(json: serde_json::Value) -> Envelope {
        Envelope::parse(json.to_string().as_bytes(), 1 << 16).unwrap()
    }

    async fn next_json(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> serde_json::Value {
        match rx.recv().await {
            Some(Outgoing::Message(msg)) => serde_json::from_str(&msg.to_json().unwrap()).unwrap(),
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_content_mode_records_history() {
        let handler = handler(vec![
            StreamEvent::Content("Hel".to_string()),
            StreamEvent::Content("lo".to_string()),
            StreamEvent::Finished {
                finish_reason: "stop".to_string(),
            },
        ]);
        let (conn, mut rx) = connection();

        handler
            .handle(
                &conn,
                "start",
                &envelope(serde_json::json!({
                    "type": "llm:start",
                    "taskId": "t1",
                    "content": "Hi",
                })),
            )
            .await
            .unwrap();

        let started = next_json(&mut rx).await;
        assert_eq!(started["type"], "llm:started");
        assert_eq!(started["backend"], "scripted");
        assert_eq!(started["model"], "script-1");

        assert_eq!(next_json(&mut rx).await["sequence"], 1);
        assert_eq!(next_json(&mut rx).await["sequence"], 2);
        let done = next_json(&mut rx).await;
        assert_eq!(done["type"], "llm:done");
        assert_eq!(done["chunkCount"], 2);
        assert_eq!(done["contentLength"], 5);

        let history = conn.history();
        assert_eq!(history, vec![ChatTurn::user("Hi"), ChatTurn::assistant("Hello")]);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let handler = handler(vec![]);
        let (conn, _rx) = connection();

        let err = handler
            .handle(&conn, "start", &envelope(serde_json::json!({"type": "llm:start"})))
            .await
            .unwrap_err();
        assert_eq!(err.into_details().code, ErrorCode::InvalidRequest);

        let err = handler
            .handle(
                &conn,
                "start",
                &envelope(serde_json::json!({
                    "type": "llm:start",
                    "content": "x",
                    "model": "nope",
                })),
            )
            .await
            .unwrap_err();
        let details = err.into_details();
        assert_eq!(details.code, ErrorCode::UnknownModel);
        assert_eq!(details.available_providers, vec!["scripted".to_string()]);

        let err = handler
            .handle(
                &conn,
                "start",
                &envelope(serde_json::json!({
                    "type": "llm:start",
                    "content": "x",
                    "backend": "openai",
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.into_details().code, ErrorCode::ProviderNotConfigured);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_provider_error() {
        let handler = handler(vec![StreamEvent::Content("partial".to_string())]);
        let (conn, mut rx) = connection();

        handler
            .handle(
                &conn,
                "start",
                &envelope(serde_json::json!({
                    "type": "llm:start",
                    "taskId": "t1",
                    "content": "Hi",
                })),
            )
            .await
            .unwrap();

        assert_eq!(next_json(&mut rx).await["type"], "llm:started");
        assert_eq!(next_json(&mut rx).await["type"], "llm:chunk");
        let error = next_json(&mut rx).await;
        assert_eq!(error["type"], "llm:error");
        assert_eq!(error["code"], "PROVIDER_ERROR");
        assert_eq!(error["retryable"], true);
        assert_eq!(error["backend"], "scripted");
        assert!(conn.history().is_empty());
        assert_eq!(conn.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let handler = handler(vec![]);
        let (conn, _rx) = connection();
        let err = handler
            .handle(
                &conn,
                "cancel",
                &envelope(serde_json::json!({"type": "llm:cancel", "taskId": "missing"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.into_details().code, ErrorCode::TaskNotFound);
    }

    #[tokio::test]
    async fn test_providers_and_clear() {
        let handler = handler(vec![]);
        let (conn, mut rx) = connection();
        conn.push_history([ChatTurn::user("a"), ChatTurn::assistant("b")]);

        handler
            .handle(&conn, "providers", &envelope(serde_json::json!({"type": "llm:providers"})))
            .await
            .unwrap();
        let json = next_json(&mut rx).await;
        assert_eq!(json["providers"][0]["name"], "scripted");
        assert_eq!(json["providers"][0]["defaultModel"], "script-1");

        handler
            .handle(&conn, "clear", &envelope(serde_json::json!({"type": "llm:clear"})))
            .await
            .unwrap();
        let json = next_json(&mut rx).await;
        assert_eq!(json["type"], "llm:history_cleared");
        assert_eq!(json["turns"], 2);
    }
}
