//! `admin` domain: connection introspection, blocking and broadcast

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::handlers::{DomainHandler, HandlerError};
use crate::protocol::{DomainEvent, Envelope, ErrorCode, ErrorDetails, EventBody, ServerMessage};
use crate::state::{Connection, ConnectionRegistry, RegistryError};
use crate::types::ConnectionId;

const DOMAIN: &str = "admin";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockRequest {
    connection_id: ConnectionId,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnblockRequest {
    connection_id: ConnectionId,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Audience {
    #[default]
    All,
    Authenticated,
    Anonymous,
}

impl Audience {
    fn includes(&self, conn: &Connection) -> bool {
        match self {
            Audience::All => true,
            Audience::Authenticated => conn.is_authenticated(),
            Audience::Anonymous => !conn.is_authenticated(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    message: String,
    #[serde(default)]
    audience: Audience,
}

fn not_found(connection_id: &str) -> HandlerError {
    HandlerError::Rejected(ErrorDetails::new(
        ErrorCode::ConnectionNotFound,
        format!("Connection '{}' not found", connection_id),
    ))
}

pub struct AdminHandler {
    registry: Arc<ConnectionRegistry>,
}

impl AdminHandler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DomainHandler for AdminHandler {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    async fn handle(
        &self,
        conn: &Arc<Connection>,
        action: &str,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        let body = match action {
            "connections" => EventBody::Connections {
                connections: self.registry.list().await,
            },
            "block" => {
                let request: BlockRequest = envelope.decode()?;
                let reason = request
                    .reason
                    .unwrap_or_else(|| "Blocked by administrator".to_string());
                match self.registry.block(&request.connection_id, &reason).await {
                    Ok(()) => {}
                    Err(RegistryError::NotFound(_)) => {
                        return Err(not_found(&request.connection_id))
                    }
                    Err(e) => return Err(HandlerError::InvalidRequest(e.to_string())),
                }
                tracing::info!(
                    "Admin {} blocked connection {}",
                    conn.id,
                    request.connection_id
                );
                EventBody::Blocked {
                    connection_id: request.connection_id,
                    reason,
                }
            }
            "unblock" => {
                let request: UnblockRequest = envelope.decode()?;
                if !self.registry.unblock(&request.connection_id).await {
                    return Err(not_found(&request.connection_id));
                }
                EventBody::Unblocked {
                    connection_id: request.connection_id,
                }
            }
            "broadcast" => {
                let request: BroadcastRequest = envelope.decode()?;
                let audience = request.audience;
                let recipients = self
                    .registry
                    .broadcast(
                        ServerMessage::Notice {
                            message: request.message,
                        },
                        |c| audience.includes(c),
                    )
                    .await;
                EventBody::BroadcastSent { recipients }
            }
            other => return Err(HandlerError::UnknownAction(other.to_string())),
        };

        conn.send(DomainEvent::new(DOMAIN, None, body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtVerifier;
    use crate::blocklist::StaticBlockList;
    use crate::state::Outgoing;
    use crate::telemetry::TracingTelemetry;
    use crate::types::Identity;
    use tokio::sync::mpsc;

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            Arc::new(JwtVerifier::new(None)),
            Arc::new(StaticBlockList::default()),
            Arc::new(TracingTelemetry),
            4,
        ))
    }

    fn envelope(json: serde_json::Value) -> Envelope {
        Envelope::parse(json.to_string().as_bytes(), 1 << 16).unwrap()
    }

    fn drain_types(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outgoing::Message(msg) = item {
                let json: serde_json::Value =
                    serde_json::from_str(&msg.to_json().unwrap()).unwrap();
                kinds.push(json["type"].as_str().unwrap_or_default().to_string());
            }
        }
        kinds
    }

    #[tokio::test]
    async fn test_broadcast_to_audience() {
        let registry = registry();
        let handler = AdminHandler::new(registry.clone());

        let (tx, mut admin_rx) = mpsc::unbounded_channel();
        let admin = registry.register(tx, None).await.unwrap();
        admin.set_identity(Identity {
            sub: "root".to_string(),
            name: None,
            roles: vec!["admin".to_string()],
            exp: 0,
        });
        let (tx, mut anon_rx) = mpsc::unbounded_channel();
        registry.register(tx, None).await.unwrap();

        handler
            .handle(
                &admin,
                "broadcast",
                &envelope(serde_json::json!({
                    "type": "admin:broadcast",
                    "message": "maintenance at noon",
                    "audience": "anonymous"
                })),
            )
            .await
            .unwrap();

        assert_eq!(drain_types(&mut anon_rx), vec!["connection:notice"]);
        assert_eq!(drain_types(&mut admin_rx), vec!["admin:broadcast_sent"]);
    }

    #[tokio::test]
    async fn test_block_unknown_connection() {
        let registry = registry();
        let handler = AdminHandler::new(registry.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let admin = registry.register(tx, None).await.unwrap();

        let err = handler
            .handle(
                &admin,
                "block",
                &envelope(serde_json::json!({"type": "admin:block", "connectionId": "ghost"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.into_details().code, ErrorCode::ConnectionNotFound);

        let err = handler
            .handle(
                &admin,
                "unblock",
                &envelope(serde_json::json!({"type": "admin:unblock", "connectionId": "ghost"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.into_details().code, ErrorCode::ConnectionNotFound);
    }

    #[tokio::test]
    async fn test_block_and_list() {
        let registry = registry();
        let handler = AdminHandler::new(registry.clone());
        let (tx, mut admin_rx) = mpsc::unbounded_channel();
        let admin = registry.register(tx, None).await.unwrap();
        let (tx, mut target_rx) = mpsc::unbounded_channel();
        let target = registry.register(tx, None).await.unwrap();

        handler
            .handle(
                &admin,
                "connections",
                &envelope(serde_json::json!({"type": "admin:connections"})),
            )
            .await
            .unwrap();
        handler
            .handle(
                &admin,
                "block",
                &envelope(serde_json::json!({
                    "type": "admin:block",
                    "connectionId": target.id,
                    "reason": "flooding"
                })),
            )
            .await
            .unwrap();

        assert!(target.is_closed());
        assert_eq!(drain_types(&mut target_rx), vec!["connection:blocked"]);
        assert_eq!(
            drain_types(&mut admin_rx),
            vec!["admin:connections", "admin:blocked"]
        );
        assert_eq!(registry.count().await, 1);
    }
}
