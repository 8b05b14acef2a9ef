//! Per-connection record: transport handle, identity, liveness and owned tasks.
//!
//! The task map lock is held for every check-and-enqueue on a task, so an event
//! for a task is only queued while that task is still active. Whoever removes a
//! task from the map is the only party allowed to emit its terminal event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::Outbound;
use crate::types::{ChatTurn, Claims, ConnectionId, Identity, TaskId};

/// Frames queued for a connection's writer
#[derive(Debug, Clone)]
pub enum Outgoing {
    Message(Outbound),
    /// Transport-level heartbeat ping
    Ping,
    /// Flush everything queued before this, then close the transport
    Close { reason: String },
}

/// One in-flight streaming task owned by a connection
#[derive(Debug)]
pub struct ActiveTask {
    pub id: TaskId,
    pub cancel: CancellationToken,
    pub started_at: Instant,
    pub backend: String,
    pub model: String,
    /// Number of content fragments forwarded so far
    pub sequence: u64,
    /// Content forwarded so far
    pub content: String,
}

impl ActiveTask {
    pub fn new(id: TaskId, backend: String, model: String) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
            backend,
            model,
            sequence: 0,
            content: String::new(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertTaskError {
    AtCapacity,
    Duplicate,
}

#[derive(Debug)]
struct Session {
    identity: Option<Identity>,
    claims: Option<Claims>,
    blocked: Option<String>,
    last_activity: DateTime<Utc>,
}

/// Admin-facing snapshot of a connection
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub remote_addr: Option<String>,
    pub authenticated: bool,
    pub user: Option<Claims>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub connected_at: String,
    pub last_activity: String,
    pub message_count: u64,
    pub active_tasks: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Connection {
    pub id: ConnectionId,
    pub remote_addr: Option<IpAddr>,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    closed: CancellationToken,
    alive: AtomicBool,
    message_count: AtomicU64,
    session: Mutex<Session>,
    tasks: Mutex<HashMap<TaskId, ActiveTask>>,
    history: Mutex<VecDeque<ChatTurn>>,
    history_capacity: usize,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<IpAddr>,
        outbound: mpsc::UnboundedSender<Outgoing>,
        history_capacity: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_addr,
            connected_at: now,
            outbound,
            closed: CancellationToken::new(),
            alive: AtomicBool::new(true),
            message_count: AtomicU64::new(0),
            session: Mutex::new(Session {
                identity: None,
                claims: None,
                blocked: None,
                last_activity: now,
            }),
            tasks: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    // --- transport ---

    /// Queue a message for the peer. Returns false if the transport is gone.
    pub fn send(&self, message: impl Into<Outbound>) -> bool {
        self.outbound
            .send(Outgoing::Message(message.into()))
            .is_ok()
    }

    pub fn ping(&self) -> bool {
        self.outbound.send(Outgoing::Ping).is_ok()
    }

    /// Force-close the transport after flushing queued messages
    pub fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.outbound.send(Outgoing::Close {
            reason: reason.to_string(),
        });
        self.closed.cancel();
    }

    /// Signal that fires once the connection has been force-closed
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    // --- liveness ---

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Read and clear the heartbeat flag
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    pub fn mark_activity(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        lock(&self.session).last_activity = Utc::now();
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    // --- identity ---

    /// Attach a verified identity, recomputing claims
    pub fn set_identity(&self, identity: Identity) -> Claims {
        let claims = Claims::from(&identity);
        let mut session = lock(&self.session);
        session.identity = Some(identity);
        session.claims = Some(claims.clone());
        claims
    }

    pub fn clear_identity(&self) {
        let mut session = lock(&self.session);
        session.identity = None;
        session.claims = None;
    }

    pub fn claims(&self) -> Option<Claims> {
        lock(&self.session).claims.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.session).identity.is_some()
    }

    // --- blocking ---

    pub fn block(&self, reason: &str) {
        lock(&self.session).blocked = Some(reason.to_string());
    }

    /// Clear the blocked flag. Returns true if it was set.
    pub fn unblock(&self) -> bool {
        lock(&self.session).blocked.take().is_some()
    }

    pub fn blocked_reason(&self) -> Option<String> {
        lock(&self.session).blocked.clone()
    }

    // --- tasks ---

    pub fn active_task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        lock(&self.tasks).contains_key(task_id)
    }

    /// Register a task unless the connection is at `cap` or the id is taken
    pub fn insert_task(&self, task: ActiveTask, cap: usize) -> Result<(), InsertTaskError> {
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(&task.id) {
            return Err(InsertTaskError::Duplicate);
        }
        if tasks.len() >= cap {
            return Err(InsertTaskError::AtCapacity);
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Run `f` against a live task and queue whatever it returns.
    ///
    /// Returns false (and does not call `f`) once the task has been removed or
    /// its token set.
    pub fn with_task<F>(&self, task_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ActiveTask) -> Option<Outbound>,
    {
        let mut tasks = lock(&self.tasks);
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        if task.cancel.is_cancelled() {
            return false;
        }
        if let Some(message) = f(task) {
            self.send(message);
        }
        true
    }

    /// Set the task's token, remove it, and queue its terminal event.
    ///
    /// Returns the removed task, or None if it was already gone; only the
    /// caller that gets `Some` owns the terminal event.
    pub fn finish_task<F>(&self, task_id: &str, terminal: F) -> Option<ActiveTask>
    where
        F: FnOnce(&ActiveTask) -> Option<Outbound>,
    {
        let mut tasks = lock(&self.tasks);
        tasks.get(task_id)?.cancel.cancel();
        let task = tasks.remove(task_id)?;
        if let Some(message) = terminal(&task) {
            self.send(message);
        }
        Some(task)
    }

    /// Finish every active task, in task id order
    pub fn finish_all_tasks<F>(&self, terminal: F) -> Vec<ActiveTask>
    where
        F: Fn(&ActiveTask) -> Option<Outbound>,
    {
        let mut tasks = lock(&self.tasks);
        for task in tasks.values() {
            task.cancel.cancel();
        }
        let mut drained: Vec<ActiveTask> = tasks.drain().map(|(_, task)| task).collect();
        drained.sort_by(|a, b| a.id.cmp(&b.id));
        for task in &drained {
            if let Some(message) = terminal(task) {
                self.send(message);
            }
        }
        drained
    }

    // --- conversation history ---

    pub fn history(&self) -> Vec<ChatTurn> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Append turns, evicting the oldest beyond capacity
    pub fn push_history(&self, turns: impl IntoIterator<Item = ChatTurn>) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = lock(&self.history);
        for turn in turns {
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(turn);
        }
    }

    /// Empty the history ring, returning how many turns were dropped
    pub fn clear_history(&self) -> usize {
        let mut history = lock(&self.history);
        let turns = history.len();
        history.clear();
        turns
    }

    pub fn summary(&self) -> ConnectionSummary {
        let (claims, blocked, last_activity, authenticated) = {
            let session = lock(&self.session);
            (
                session.claims.clone(),
                session.blocked.clone(),
                session.last_activity,
                session.identity.is_some(),
            )
        };
        ConnectionSummary {
            id: self.id.clone(),
            remote_addr: self.remote_addr.map(|addr| addr.to_string()),
            authenticated,
            user: claims,
            blocked: blocked.is_some(),
            block_reason: blocked,
            connected_at: self.connected_at.to_rfc3339(),
            last_activity: last_activity.to_rfc3339(),
            message_count: self.message_count(),
            active_tasks: self.active_task_count(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("active_tasks", &self.active_task_count())
            .finish()
    }
}
