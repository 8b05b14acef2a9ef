use crate::state::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn a background task that pings every connection and reaps the ones that
/// did not answer the previous round
pub fn spawn_heartbeat(registry: Arc<ConnectionRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reaped = sweep(&registry).await;
            if reaped > 0 {
                tracing::info!("Heartbeat reaped {} unresponsive connection(s)", reaped);
            }
        }
    })
}

/// One heartbeat round. Returns how many connections were disconnected.
pub async fn sweep(registry: &ConnectionRegistry) -> usize {
    let mut reaped = 0;
    for connection in registry.snapshot().await {
        if connection.take_alive() {
            connection.ping();
        } else {
            tracing::debug!("Connection {} missed its heartbeat", connection.id);
            if registry
                .disconnect(&connection.id, "heartbeat timeout")
                .await
                .is_some()
            {
                reaped += 1;
            }
        }
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtVerifier;
    use crate::blocklist::StaticBlockList;
    use crate::state::{ActiveTask, Outgoing};
    use crate::telemetry::TracingTelemetry;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_sweep_reaps_silent_connections() {
        let registry = ConnectionRegistry::new(
            Arc::new(JwtVerifier::new(None)),
            Arc::new(StaticBlockList::default()),
            Arc::new(TracingTelemetry),
            4,
        );
        let (tx, mut quiet_rx) = mpsc::unbounded_channel();
        let quiet = registry.register(tx, None).await.unwrap();
        let (tx, _lively_rx) = mpsc::unbounded_channel();
        let lively = registry.register(tx, None).await.unwrap();

        quiet
            .insert_task(
                ActiveTask::new("t1".to_string(), "openai".to_string(), "m".to_string()),
                4,
            )
            .unwrap();

        // Round one: everyone is fresh, everyone gets pinged
        assert_eq!(sweep(&registry).await, 0);
        assert!(matches!(quiet_rx.try_recv(), Ok(Outgoing::Ping)));

        // Only one peer answers
        lively.mark_alive();
        assert_eq!(sweep(&registry).await, 1);

        assert!(quiet.is_closed());
        assert_eq!(quiet.active_task_count(), 0);
        assert!(!lively.is_closed());
        assert_eq!(registry.count().await, 1);
    }
}
