//! Message routing
//!
//! Every inbound frame goes through [`MessageRouter::handle_frame`]: envelope
//! validation, blocked check, built-in messages, permission rules, then dispatch
//! to the registered domain handler. Failures are turned into error replies here;
//! nothing a handler does can take the connection down.

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::protocol::{DomainEvent, Envelope, ErrorCode, ErrorDetails, MessageType, ServerMessage};
use crate::state::{Connection, ConnectionRegistry};
use crate::types::Claim;

/// Why a handler refused or failed a message
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{}", .0.message)]
    Rejected(ErrorDetails),
}

impl HandlerError {
    pub fn into_details(self) -> ErrorDetails {
        match self {
            HandlerError::UnknownAction(action) => {
                ErrorDetails::new(ErrorCode::UnknownAction, format!("Unknown action '{}'", action))
            }
            HandlerError::InvalidRequest(msg) => ErrorDetails::new(ErrorCode::InvalidRequest, msg),
            HandlerError::Rejected(details) => details,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::InvalidRequest(e.to_string())
    }
}

/// A named group of actions (`<domain>:<action>`)
#[async_trait]
pub trait DomainHandler: Send + Sync {
    fn domain(&self) -> &'static str;

    /// Handle one action. Replies are sent on `conn`; an `Err` becomes a
    /// `{domain}:error` event.
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        action: &str,
        envelope: &Envelope,
    ) -> Result<(), HandlerError>;
}

/// Access requirements for a message type; absence of a rule means public
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionRule {
    pub requires_authentication: bool,
    pub required_claim: Option<Claim>,
}

impl PermissionRule {
    pub fn authenticated() -> Self {
        Self {
            requires_authentication: true,
            required_claim: None,
        }
    }

    /// Requires an authenticated connection holding `claim`
    pub fn claim(claim: Claim) -> Self {
        Self {
            requires_authentication: true,
            required_claim: Some(claim),
        }
    }

    fn check(&self, conn: &Connection) -> Result<(), ErrorDetails> {
        let claims = conn.claims();
        if (self.requires_authentication || self.required_claim.is_some()) && claims.is_none() {
            return Err(ErrorDetails::new(
                ErrorCode::AuthRequired,
                "Authentication required",
            ));
        }
        if let (Some(required), Some(claims)) = (self.required_claim, claims) {
            if !claims.has(required) {
                let mut details = ErrorDetails::new(
                    ErrorCode::Forbidden,
                    format!("Missing required claim '{}'", required.as_str()),
                );
                details.required_claim = Some(required);
                return Err(details);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    token: String,
}

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    max_message_bytes: usize,
    handlers: HashMap<&'static str, Arc<dyn DomainHandler>>,
    rules: HashMap<String, PermissionRule>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, max_message_bytes: usize) -> Self {
        Self {
            registry,
            max_message_bytes,
            handlers: HashMap::new(),
            rules: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn DomainHandler>) {
        tracing::debug!("Registered domain handler '{}'", handler.domain());
        self.handlers.insert(handler.domain(), handler);
    }

    /// Attach a rule to an exact type (`llm:start`) or a whole domain (`admin:*`)
    pub fn add_rule(&mut self, kind: impl Into<String>, rule: PermissionRule) {
        self.rules.insert(kind.into(), rule);
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.handlers.keys().map(|d| d.to_string()).collect();
        domains.sort();
        domains
    }

    fn rule_for(&self, kind: &str, domain: &str) -> Option<&PermissionRule> {
        self.rules
            .get(kind)
            .or_else(|| self.rules.get(&format!("{}:*", domain)))
    }

    /// Process one raw inbound frame
    pub async fn handle_frame(&self, conn: &Arc<Connection>, bytes: &[u8]) {
        self.registry.mark_activity(&conn.id).await;

        let envelope = match Envelope::parse(bytes, self.max_message_bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("Rejected frame from {}: {}", conn.id, e);
                conn.send(ServerMessage::error(e.code(), e.to_string()));
                return;
            }
        };

        if let Some(reason) = conn.blocked_reason() {
            conn.send(ServerMessage::error(
                ErrorCode::ConnectionBlocked,
                format!("Connection is blocked: {}", reason),
            ));
            return;
        }

        let (domain, action) = match &envelope.message_type {
            MessageType::Ping => {
                conn.send(ServerMessage::Pong);
                return;
            }
            MessageType::Pong => return,
            MessageType::Scoped { domain, action } => (domain.as_str(), action.as_str()),
        };

        if domain == "auth" {
            self.handle_auth(conn, action, &envelope).await;
            return;
        }

        if let Some(rule) = self.rule_for(&envelope.kind, domain) {
            if let Err(details) = rule.check(conn) {
                tracing::debug!(
                    "Denied {} for {}: {}",
                    envelope.kind,
                    conn.id,
                    details.message
                );
                self.send_error(conn, domain, &envelope, details);
                return;
            }
        }

        let Some(handler) = self.handlers.get(domain) else {
            conn.send(ServerMessage::Error {
                code: ErrorCode::UnknownDomain,
                message: format!("Unknown domain '{}'", domain),
                domains: self.domains(),
            });
            return;
        };

        tracing::debug!("Dispatching {} from {}", envelope.kind, conn.id);
        let result = AssertUnwindSafe(handler.handle(conn, action, &envelope))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("{} failed for {}: {}", envelope.kind, conn.id, e);
                self.send_error(conn, domain, &envelope, e.into_details());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Handler for {} panicked: {}", envelope.kind, message);
                self.send_error(
                    conn,
                    domain,
                    &envelope,
                    ErrorDetails::new(
                        ErrorCode::HandlerError,
                        format!("Internal error handling '{}'", envelope.kind),
                    ),
                );
            }
        }
    }

    async fn handle_auth(&self, conn: &Arc<Connection>, action: &str, envelope: &Envelope) {
        match action {
            "login" => {
                let request: LoginRequest = match envelope.decode() {
                    Ok(request) => request,
                    Err(e) => {
                        conn.send(ServerMessage::AuthError {
                            code: ErrorCode::InvalidRequest,
                            message: e.to_string(),
                        });
                        return;
                    }
                };
                match self.registry.authenticate(&conn.id, &request.token).await {
                    Ok(user) => {
                        conn.send(ServerMessage::AuthSuccess { user });
                    }
                    Err(e) => {
                        conn.send(ServerMessage::AuthError {
                            code: ErrorCode::InvalidToken,
                            message: e.to_string(),
                        });
                    }
                }
            }
            "logout" => {
                if self.registry.logout(&conn.id).await.is_ok() {
                    conn.send(ServerMessage::LoggedOut {});
                }
            }
            other => {
                conn.send(ServerMessage::AuthError {
                    code: ErrorCode::UnknownAction,
                    message: format!("Unknown action '{}'", other),
                });
            }
        }
    }

    fn send_error(
        &self,
        conn: &Connection,
        domain: &str,
        envelope: &Envelope,
        details: ErrorDetails,
    ) {
        conn.send(DomainEvent::error(
            domain,
            envelope.task_id().map(str::to_string),
            details,
        ));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
