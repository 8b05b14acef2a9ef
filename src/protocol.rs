//! Wire protocol: inbound envelopes and outbound events.
//!
//! Every frame carries one JSON object with a `type` field of the form
//! `<domain>:<action>` (except `ping` / `pong`). Outbound messages additionally
//! carry a `timestamp`.

use crate::llm::{ModelInfo, ProviderInfo};
use crate::state::ConnectionSummary;
use crate::types::{Claim, Claims, TaskId};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Machine-readable error codes sent to peers
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MessageTooLarge,
    ParseError,
    MissingType,
    InvalidType,
    UnknownDomain,
    UnknownAction,
    ConnectionBlocked,
    AuthRequired,
    Forbidden,
    InvalidToken,
    InvalidRequest,
    TooManyTasks,
    UnknownModel,
    ProviderNotConfigured,
    DuplicateTask,
    TaskNotFound,
    Timeout,
    ProviderError,
    ConnectionNotFound,
    HandlerError,
}

impl ErrorCode {
    /// Whether the peer may retry the same request later
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::TooManyTasks | ErrorCode::Timeout | ErrorCode::ProviderError
        )
    }
}

/// Envelope-level failures. These never close the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid message format: {0}")]
    Parse(String),

    #[error("Message is missing a string `type` field")]
    MissingType,

    #[error("Message type '{0}' is not of the form <domain>:<action>")]
    InvalidType(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::TooLarge { .. } => ErrorCode::MessageTooLarge,
            ProtocolError::Parse(_) => ErrorCode::ParseError,
            ProtocolError::MissingType => ErrorCode::MissingType,
            ProtocolError::InvalidType(_) => ErrorCode::InvalidType,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    Pong,
    Scoped { domain: String, action: String },
}

/// A validated inbound message
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The raw `type` string
    pub kind: String,
    pub message_type: MessageType,
    pub body: Value,
}

impl Envelope {
    /// Parse one raw frame, enforcing the size limit before touching the payload
    pub fn parse(bytes: &[u8], max_bytes: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > max_bytes {
            return Err(ProtocolError::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }

        let body: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        if !body.is_object() {
            return Err(ProtocolError::Parse("expected a JSON object".to_string()));
        }

        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        let message_type = match kind.as_str() {
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            other => match other.split_once(':') {
                Some((domain, action)) if !domain.is_empty() && !action.is_empty() => {
                    MessageType::Scoped {
                        domain: domain.to_string(),
                        action: action.to_string(),
                    }
                }
                _ => return Err(ProtocolError::InvalidType(other.to_string())),
            },
        };

        Ok(Self {
            kind,
            message_type,
            body,
        })
    }

    /// The `<domain>` prefix, if this is a scoped message
    pub fn domain(&self) -> Option<&str> {
        match &self.message_type {
            MessageType::Scoped { domain, .. } => Some(domain),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.body.get("taskId").and_then(Value::as_str)
    }

    /// Deserialize the domain-specific fields of this message
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// Connection-level and built-in messages with fixed type names
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection:welcome", rename_all = "camelCase")]
    Welcome {
        connection_id: String,
        authenticated: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<Claims>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_error: Option<String>,
        providers: Vec<String>,
        max_concurrent_tasks: usize,
    },
    #[serde(rename = "connection:blocked")]
    Blocked { reason: String },
    #[serde(rename = "connection:notice")]
    Notice { message: String },
    #[serde(rename = "connection:shutdown")]
    Shutdown { reason: String },
    #[serde(rename = "pong")]
    Pong,
    /// Protocol-level error (malformed frame, unknown domain, ...)
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        domains: Vec<String>,
    },
    #[serde(rename = "auth:success")]
    AuthSuccess { user: Claims },
    #[serde(rename = "auth:error")]
    AuthError { code: ErrorCode, message: String },
    #[serde(rename = "auth:logged_out")]
    LoggedOut {},
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            domains: Vec::new(),
        }
    }
}

/// Details of a `{domain}:error` event
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available_providers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_claim: Option<Claim>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
            backend: None,
            model: None,
            available_providers: Vec::new(),
            required_claim: None,
        }
    }

    pub fn with_target(mut self, backend: &str, model: &str) -> Self {
        self.backend = Some(backend.to_string());
        self.model = Some(model.to_string());
        self
    }

    pub fn with_available_providers(mut self, providers: Vec<String>) -> Self {
        self.available_providers = providers;
        self
    }
}

/// Payload of a domain-scoped event; the variant decides the `<action>` suffix
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventBody {
    #[serde(rename_all = "camelCase")]
    Started {
        backend: String,
        model: String,
        supports_reasoning: bool,
        timeout_ms: u64,
    },
    Chunk {
        content: String,
        sequence: u64,
    },
    Thinking {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        chunk_count: u64,
        content_length: usize,
        finish_reason: String,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        partial_content: String,
        chunk_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    CancelledAll {
        task_ids: Vec<TaskId>,
    },
    Error(ErrorDetails),
    Providers {
        providers: Vec<ProviderInfo>,
    },
    Models {
        models: Vec<ModelInfo>,
    },
    HistoryCleared {
        turns: usize,
    },
    Connections {
        connections: Vec<ConnectionSummary>,
    },
    #[serde(rename_all = "camelCase")]
    Blocked {
        connection_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Unblocked {
        connection_id: String,
    },
    BroadcastSent {
        recipients: usize,
    },
}

impl EventBody {
    pub fn action(&self) -> &'static str {
        match self {
            EventBody::Started { .. } => "started",
            EventBody::Chunk { .. } => "chunk",
            EventBody::Thinking { .. } => "thinking",
            EventBody::Done { .. } => "done",
            EventBody::Cancelled { .. } => "cancelled",
            EventBody::CancelledAll { .. } => "cancelled_all",
            EventBody::Error(_) => "error",
            EventBody::Providers { .. } => "providers",
            EventBody::Models { .. } => "models",
            EventBody::HistoryCleared { .. } => "history_cleared",
            EventBody::Connections { .. } => "connections",
            EventBody::Blocked { .. } => "blocked",
            EventBody::Unblocked { .. } => "unblocked",
            EventBody::BroadcastSent { .. } => "broadcast_sent",
        }
    }
}

/// An event scoped to a domain, serialized as `{domain}:{action}`
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub domain: String,
    pub task_id: Option<TaskId>,
    pub body: EventBody,
}

impl DomainEvent {
    pub fn new(domain: impl Into<String>, task_id: Option<TaskId>, body: EventBody) -> Self {
        Self {
            domain: domain.into(),
            task_id,
            body,
        }
    }

    pub fn error(
        domain: impl Into<String>,
        task_id: Option<TaskId>,
        details: ErrorDetails,
    ) -> Self {
        Self::new(domain, task_id, EventBody::Error(details))
    }

    pub fn kind(&self) -> String {
        format!("{}:{}", self.domain, self.body.action())
    }
}

impl Serialize for DomainEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(rename = "type")]
            kind: String,
            #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
            task_id: Option<&'a str>,
            #[serde(flatten)]
            body: &'a EventBody,
        }

        Wire {
            kind: self.kind(),
            task_id: self.task_id.as_deref(),
            body: &self.body,
        }
        .serialize(serializer)
    }
}

/// Anything that can be written to a peer
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Server(ServerMessage),
    Domain(DomainEvent),
}

impl Outbound {
    /// Serialize with the send timestamp attached
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Stamped<'a> {
            #[serde(flatten)]
            message: &'a Outbound,
            timestamp: String,
        }

        serde_json::to_string(&Stamped {
            message: self,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Outbound::Server(msg)
    }
}

impl From<DomainEvent> for Outbound {
    fn from(event: DomainEvent) -> Self {
        Outbound::Domain(event)
    }
}
