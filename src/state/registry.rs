//! Registry of live connections

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionSummary, Outgoing};
use crate::auth::{AuthError, IdentityVerifier};
use crate::blocklist::BlockList;
use crate::protocol::{Outbound, ServerMessage};
use crate::telemetry::{TaskOutcome, TelemetryRecord, TelemetrySink};
use crate::types::{Claims, ConnectionId};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Connection blocked: {0}")]
    Blocked(String),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Connection '{0}' not found")]
    NotFound(ConnectionId),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    verifier: Arc<dyn IdentityVerifier>,
    block_list: Arc<dyn BlockList>,
    telemetry: Arc<dyn TelemetrySink>,
    history_capacity: usize,
    accepting: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        block_list: Arc<dyn BlockList>,
        telemetry: Arc<dyn TelemetrySink>,
        history_capacity: usize,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            verifier,
            block_list,
            telemetry,
            history_capacity,
            accepting: AtomicBool::new(true),
        }
    }

    /// Create a record for a freshly accepted transport.
    ///
    /// Fails closed: a blocked peer gets a `connection:blocked` notice and the
    /// transport is closed before an error is returned.
    pub async fn register(
        &self,
        outbound: mpsc::UnboundedSender<Outgoing>,
        remote_addr: Option<IpAddr>,
    ) -> Result<Arc<Connection>, RegistryError> {
        if !self.accepting.load(Ordering::SeqCst) {
            let _ = outbound.send(Outgoing::Message(
                ServerMessage::Shutdown {
                    reason: "Server is shutting down".to_string(),
                }
                .into(),
            ));
            let _ = outbound.send(Outgoing::Close {
                reason: "shutting down".to_string(),
            });
            return Err(RegistryError::ShuttingDown);
        }

        let id = ulid::Ulid::new().to_string();

        if let Some(reason) = self.block_list.check(&id, remote_addr).await {
            tracing::warn!(remote_addr = ?remote_addr, "Refusing blocked connection: {}", reason);
            let _ = outbound.send(Outgoing::Message(
                ServerMessage::Blocked {
                    reason: reason.clone(),
                }
                .into(),
            ));
            let _ = outbound.send(Outgoing::Close {
                reason: "blocked".to_string(),
            });
            return Err(RegistryError::Blocked(reason));
        }

        let connection = Arc::new(Connection::new(
            id.clone(),
            remote_addr,
            outbound,
            self.history_capacity,
        ));
        self.connections
            .write()
            .await
            .insert(id.clone(), connection.clone());

        tracing::info!("Connection {} registered", id);
        Ok(connection)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Verify a token and update the connection's identity in place
    pub async fn authenticate(&self, id: &str, token: &str) -> Result<Claims, RegistryError> {
        let connection = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let identity = self.verifier.verify(token)?;
        let claims = connection.set_identity(identity);
        tracing::info!(
            "Connection {} authenticated as {}",
            id,
            claims.user_id
        );
        Ok(claims)
    }

    pub async fn logout(&self, id: &str) -> Result<(), RegistryError> {
        let connection = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        connection.clear_identity();
        Ok(())
    }

    pub async fn mark_activity(&self, id: &str) {
        if let Some(connection) = self.get(id).await {
            connection.mark_activity();
        }
    }

    /// Remove the record and hand it back for caller-driven cleanup
    pub async fn unregister(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(id)
    }

    /// Full cleanup path shared by peer close, heartbeat timeout, block and shutdown:
    /// cancel owned tasks, unregister, clear claims, close the transport.
    ///
    /// Idempotent: returns None if the connection was already gone.
    pub async fn disconnect(&self, id: &str, reason: &str) -> Option<Arc<Connection>> {
        let connection = self.unregister(id).await?;

        let aborted = connection.finish_all_tasks(|_| None);
        for task in &aborted {
            self.telemetry.record(TelemetryRecord::TaskFinished {
                connection_id: connection.id.clone(),
                task_id: task.id.clone(),
                backend: task.backend.clone(),
                model: task.model.clone(),
                outcome: TaskOutcome::Cancelled,
                chunks: task.sequence,
                duration_ms: task.elapsed_ms(),
            });
        }

        connection.clear_identity();
        connection.close(reason);

        self.telemetry.record(TelemetryRecord::ConnectionClosed {
            connection_id: connection.id.clone(),
            reason: reason.to_string(),
            connected_at: connection.connected_at,
            messages: connection.message_count(),
        });

        tracing::info!(
            "Connection {} disconnected ({}), {} task(s) aborted",
            id,
            reason,
            aborted.len()
        );
        Some(connection)
    }

    /// Administratively block a connection: flag it, record it in the
    /// block-list, notify the peer and run the disconnect path.
    pub async fn block(&self, id: &str, reason: &str) -> Result<(), RegistryError> {
        let connection = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        connection.block(reason);
        self.block_list
            .block(id, connection.remote_addr, reason)
            .await;
        connection.send(ServerMessage::Blocked {
            reason: reason.to_string(),
        });
        tracing::warn!("Connection {} blocked: {}", id, reason);

        self.disconnect(id, "blocked").await;
        Ok(())
    }

    /// Lift a block. Returns true if the connection or its block-list entry was blocked.
    pub async fn unblock(&self, id: &str) -> bool {
        let flag_cleared = match self.get(id).await {
            Some(connection) => connection.unblock(),
            None => false,
        };
        let entry_removed = self.block_list.unblock(id).await;
        if flag_cleared || entry_removed {
            tracing::info!("Connection {} unblocked", id);
        }
        flag_cleared || entry_removed
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Admin listing, oldest connection first
    pub async fn list(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> =
            self.snapshot().await.iter().map(|c| c.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a message to every connection matching `filter`. Returns the recipient count.
    pub async fn broadcast(
        &self,
        message: impl Into<Outbound>,
        filter: impl Fn(&Connection) -> bool,
    ) -> usize {
        let message = message.into();
        let connections = self.connections.read().await;
        let mut recipients = 0;
        for connection in connections.values() {
            if filter(connection) && connection.send(message.clone()) {
                recipients += 1;
            }
        }
        tracing::debug!("Broadcast delivered to {} connection(s)", recipients);
        recipients
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }
}
