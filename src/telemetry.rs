//! Fire-and-forget telemetry for connection and task records.
//!
//! Sinks must never fail the caller; `record` has no return value.

use chrono::{DateTime, Utc};

use crate::types::{ConnectionId, TaskId};

/// Terminal state of a streaming task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Cancelled,
    Error,
    Timeout,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Done => "done",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Error => "error",
            TaskOutcome::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TelemetryRecord {
    ConnectionOpened {
        connection_id: ConnectionId,
        remote_addr: Option<String>,
        authenticated: bool,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
        reason: String,
        connected_at: DateTime<Utc>,
        messages: u64,
    },
    TaskFinished {
        connection_id: ConnectionId,
        task_id: TaskId,
        backend: String,
        model: String,
        outcome: TaskOutcome,
        chunks: u64,
        duration_ms: u64,
    },
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: TelemetryRecord);
}

/// Default sink: structured `tracing` events
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, record: TelemetryRecord) {
        match record {
            TelemetryRecord::ConnectionOpened {
                connection_id,
                remote_addr,
                authenticated,
            } => {
                tracing::info!(
                    target: "telemetry",
                    connection_id = %connection_id,
                    remote_addr = remote_addr.as_deref().unwrap_or("unknown"),
                    authenticated,
                    "connection opened"
                );
            }
            TelemetryRecord::ConnectionClosed {
                connection_id,
                reason,
                connected_at,
                messages,
            } => {
                let lifetime_secs = (Utc::now() - connected_at).num_seconds();
                tracing::info!(
                    target: "telemetry",
                    connection_id = %connection_id,
                    reason = %reason,
                    lifetime_secs,
                    messages,
                    "connection closed"
                );
            }
            TelemetryRecord::TaskFinished {
                connection_id,
                task_id,
                backend,
                model,
                outcome,
                chunks,
                duration_ms,
            } => {
                tracing::info!(
                    target: "telemetry",
                    connection_id = %connection_id,
                    task_id = %task_id,
                    backend = %backend,
                    model = %model,
                    outcome = outcome.as_str(),
                    chunks,
                    duration_ms,
                    "task finished"
                );
            }
        }
    }
}
