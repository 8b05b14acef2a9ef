pub mod connection;
pub mod registry;

use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::IdentityVerifier;
use crate::blocklist::BlockList;
use crate::config::GatewayConfig;
use crate::llm::LlmManager;
use crate::protocol::{EventBody, DomainEvent, ServerMessage};
use crate::telemetry::{TaskOutcome, TelemetryRecord, TelemetrySink};
use crate::types::Claim;
use crate::ws::admin::AdminHandler;
use crate::ws::handlers::{MessageRouter, PermissionRule};
use crate::ws::llm::LlmHandler;

pub use connection::{ActiveTask, Connection, ConnectionSummary, InsertTaskError, Outgoing};
pub use registry::{ConnectionRegistry, RegistryError};

/// Shared application state
pub struct AppState {
    pub config: GatewayConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub router: MessageRouter,
    pub llm: Arc<LlmManager>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        llm: Arc<LlmManager>,
        verifier: Arc<dyn IdentityVerifier>,
        block_list: Arc<dyn BlockList>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            verifier,
            block_list,
            telemetry.clone(),
            config.history_capacity,
        ));

        let mut router = MessageRouter::new(registry.clone(), config.max_message_bytes);
        router.register(Arc::new(LlmHandler::new(
            llm.clone(),
            telemetry,
            config.max_tasks_per_connection,
            config.task_timeout,
        )));
        router.register(Arc::new(AdminHandler::new(registry.clone())));

        if config.llm_requires_auth {
            for kind in ["llm:start", "llm:clear"] {
                router.add_rule(kind, PermissionRule::authenticated());
            }
        }
        router.add_rule("admin:*", PermissionRule::claim(Claim::Admin));

        Self {
            config,
            registry,
            router,
            llm,
        }
    }

    /// Register a new transport, optionally authenticating it with a bootstrap token,
    /// and greet the peer.
    ///
    /// An invalid token leaves the connection anonymous; the failure is reported in
    /// the welcome message.
    pub async fn connect(
        &self,
        outbound: mpsc::UnboundedSender<Outgoing>,
        remote_addr: Option<IpAddr>,
        token: Option<&str>,
    ) -> Result<Arc<Connection>, RegistryError> {
        let connection = self.registry.register(outbound, remote_addr).await?;

        let mut auth_error = None;
        if let Some(token) = token {
            if let Err(e) = self.registry.authenticate(&connection.id, token).await {
                tracing::info!("Bootstrap token rejected for {}: {}", connection.id, e);
                auth_error = Some(e.to_string());
            }
        }

        connection.send(ServerMessage::Welcome {
            connection_id: connection.id.clone(),
            authenticated: connection.is_authenticated(),
            user: connection.claims(),
            auth_error,
            providers: self.llm.available(),
            max_concurrent_tasks: self.config.max_tasks_per_connection,
        });

        self.registry
            .telemetry()
            .record(TelemetryRecord::ConnectionOpened {
                connection_id: connection.id.clone(),
                remote_addr: remote_addr.map(|addr| addr.to_string()),
                authenticated: connection.is_authenticated(),
            });

        Ok(connection)
    }

    /// Stop accepting, notify every peer, cancel every task and close every connection
    pub async fn shutdown(&self) {
        self.registry.stop_accepting();
        let connections = self.registry.snapshot().await;
        tracing::info!("Shutting down {} connection(s)", connections.len());

        for connection in &connections {
            connection.send(ServerMessage::Shutdown {
                reason: "Server is shutting down".to_string(),
            });

            let cancelled = connection.finish_all_tasks(|task| {
                Some(
                    DomainEvent::new(
                        "llm",
                        Some(task.id.clone()),
                        EventBody::Cancelled {
                            partial_content: task.content.clone(),
                            chunk_count: task.sequence,
                        },
                    )
                    .into(),
                )
            });
            for task in cancelled {
                self.registry.telemetry().record(TelemetryRecord::TaskFinished {
                    connection_id: connection.id.clone(),
                    task_id: task.id.clone(),
                    backend: task.backend.clone(),
                    model: task.model.clone(),
                    outcome: TaskOutcome::Cancelled,
                    chunks: task.sequence,
                    duration_ms: task.elapsed_ms(),
                });
            }

            self.registry.disconnect(&connection.id, "server shutdown").await;
        }
    }
}
