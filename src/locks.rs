//! Per-record locks
//!
//! Shared by the dispatcher and the reconciler so a dispatch and a poll of
//! the same record never interleave their read-modify-write of it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::record::RecordId;

#[derive(Clone, Default)]
pub struct RecordLocks {
    locks: Arc<DashMap<RecordId, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`; released when the guard drops
    pub async fn lock(&self, id: RecordId) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.entry(id).or_default().value());
        mutex.lock_owned().await
    }
}
