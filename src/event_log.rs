//! Append-only audit log of engine events
//!
//! - Event: envelope with id + timestamp + kind
//! - EventKind: dispatch, remote, status and registration events
//! - EventLog: thread-safe, cheap to clone

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::ExecutionMode;
use crate::record::{ExecutionStatus, FeedId, RecordId};

/// Single event in the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since log creation (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Dispatched {
        record_id: RecordId,
        mode: ExecutionMode,
        argv: Vec<String>,
    },
    RemoteSubmitted {
        record_id: RecordId,
        accepted: bool,
        response: Value,
    },
    ExecutionFailed {
        record_id: RecordId,
        error: String,
    },
    StatusChanged {
        record_id: RecordId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    FilesRegistered {
        record_id: RecordId,
        feed_id: FeedId,
        discovered: usize,
        added: usize,
    },
    /// Poll could not reach a verdict; local state untouched
    PollDeferred {
        record_id: RecordId,
        reason: String,
    },
    DiagnosticCollected {
        record_id: RecordId,
        lines: Vec<String>,
    },
}

impl EventKind {
    pub fn record_id(&self) -> RecordId {
        match self {
            Self::Dispatched { record_id, .. }
            | Self::RemoteSubmitted { record_id, .. }
            | Self::ExecutionFailed { record_id, .. }
            | Self::StatusChanged { record_id, .. }
            | Self::FilesRegistered { record_id, .. }
            | Self::PollDeferred { record_id, .. }
            | Self::DiagnosticCollected { record_id, .. } => *record_id,
        }
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };
        self.events.write().push(event);
        id
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    pub fn filter_record(&self, record_id: RecordId) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.record_id() == record_id)
            .collect()
    }

    /// Count events matching a predicate
    pub fn count(&self, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.events.read().iter().filter(|e| pred(&e.kind)).count()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}
