//! Status reconciliation
//!
//! Polls the job manager for a remote record's status and folds it into
//! local state. A poll mutates the record only when the remote status
//! contains "finished" and differs from the local one; then the output
//! files are registered, the status and end time are persisted and, for
//! `finishedWithError`, the failure diagnostic is collected.
//!
//! Communication failures never change local state: the poll is deferred.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::diagnostics::{Diagnostic, ErrorCollector};
use crate::dispatch::ExecutionMode;
use crate::error::Result;
use crate::event_log::{EventKind, EventLog};
use crate::locks::RecordLocks;
use crate::record::{ExecutionRecord, ExecutionStatus, RecordId};
use crate::registrar::{FileRegistrar, Registration};
use crate::remote::JobManager;
use crate::store::{require_record, RecordStore};

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Remote status not finished, or equal to the local one
    Unchanged { remote: String },
    /// Record moved to a terminal status
    Transitioned {
        from: ExecutionStatus,
        to: ExecutionStatus,
        registration: Registration,
        diagnostic: Option<Diagnostic>,
    },
    /// Record was already terminal; nothing asked
    Settled { status: ExecutionStatus },
    /// No verdict this time (unreachable, malformed or unknown status)
    Deferred { reason: String },
}

#[derive(Clone)]
pub struct StatusReconciler {
    store: Arc<dyn RecordStore>,
    manager: Arc<dyn JobManager>,
    registrar: FileRegistrar,
    collector: ErrorCollector,
    event_log: EventLog,
    locks: RecordLocks,
}

impl StatusReconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        manager: Arc<dyn JobManager>,
        registrar: FileRegistrar,
        event_log: EventLog,
    ) -> Self {
        let collector = ErrorCollector::new(Arc::clone(&manager), event_log.clone());
        Self {
            store,
            manager,
            registrar,
            collector,
            event_log,
            locks: RecordLocks::new(),
        }
    }

    /// Share record locks with a dispatcher
    pub fn with_locks(mut self, locks: RecordLocks) -> Self {
        self.locks = locks;
        self
    }

    fn defer(&self, id: RecordId, reason: String) -> PollOutcome {
        warn!(record_id = id, reason = %reason, "Poll deferred");
        self.event_log.emit(EventKind::PollDeferred {
            record_id: id,
            reason: reason.clone(),
        });
        PollOutcome::Deferred { reason }
    }

    #[instrument(skip(self))]
    pub async fn poll(&self, id: RecordId) -> Result<PollOutcome> {
        let _guard = self.locks.lock(id).await;

        let mut record = require_record(self.store.as_ref(), id)?;
        if record.status.is_terminal() {
            return Ok(PollOutcome::Settled {
                status: record.status,
            });
        }

        let response = match self.manager.query_status(&record).await {
            Ok(response) => response,
            Err(e) if e.is_transient() => return Ok(self.defer(id, e.to_string())),
            Err(e) => return Err(e),
        };
        let remote = match response.status() {
            Ok(status) => status.to_string(),
            Err(e) => return Ok(self.defer(id, e.to_string())),
        };
        info!(record_id = id, local = %record.status, remote = %remote, "Job status");

        if !remote.contains("finished") || remote == record.status.as_str() {
            debug!(record_id = id, "No change");
            return Ok(PollOutcome::Unchanged { remote });
        }

        let next: ExecutionStatus = match remote.parse() {
            Ok(status) => status,
            Err(_) => return Ok(self.defer(id, format!("unrecognized remote status '{}'", remote))),
        };
        if !record.status.can_transition_to(next) {
            warn!(record_id = id, local = %record.status, remote = %remote, "Ignoring backward transition");
            return Ok(PollOutcome::Unchanged { remote });
        }

        info!(record_id = id, "Registering output files");
        let registration = self.registrar.register(id)?;

        let diagnostic = if next == ExecutionStatus::FinishedWithError {
            Some(self.collector.collect(&record).await)
        } else {
            None
        };

        let from = record.status;
        record.advance(next)?;
        if diagnostic.is_some() {
            record.diagnostic = diagnostic.clone();
        }
        self.store.update_record(&record)?;
        self.event_log.emit(EventKind::StatusChanged {
            record_id: id,
            from,
            to: next,
        });
        info!(record_id = id, status = %next, end_time = ?record.end_time, "Saved job status");

        Ok(PollOutcome::Transitioned {
            from,
            to: next,
            registration,
            diagnostic,
        })
    }

    /// Poll every record the job manager may be running, concurrently
    ///
    /// Besides `runningOnRemote` records this includes `started` records
    /// dispatched remotely whose submission got no answer: the job manager
    /// may have accepted them anyway.
    pub async fn poll_all(&self) -> Vec<(RecordId, Result<PollOutcome>)> {
        let mut set = JoinSet::new();
        for record in self.store.records() {
            if !may_be_remote(&record) {
                continue;
            }
            let this = self.clone();
            set.spawn(async move { (record.id, this.poll(record.id).await) });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Poll task panicked"),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        results
    }
}

fn may_be_remote(record: &ExecutionRecord) -> bool {
    match record.status {
        ExecutionStatus::RunningOnRemote => true,
        ExecutionStatus::Started => record.mode == Some(ExecutionMode::Remote),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::OutputPathResolver;
    use crate::record::{NewRecord, PluginDescriptor, PluginKind};
    use crate::remote::{JobAction, MockJobManager};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::fs;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        mock: Arc<MockJobManager>,
        registrar: FileRegistrar,
        log: EventLog,
        reconciler: StatusReconciler,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert_plugin(PluginDescriptor::new("dcm2nii", PluginKind::FilesystemRoot))
            .unwrap();
        let mock = Arc::new(MockJobManager::new());
        let log = EventLog::new();
        let resolver = OutputPathResolver::new(dir.path(), store.clone());
        let registrar = FileRegistrar::new(resolver, store.clone(), log.clone());
        let reconciler =
            StatusReconciler::new(store.clone(), mock.clone(), registrar.clone(), log.clone());
        Harness {
            _dir: dir,
            store,
            mock,
            registrar,
            log,
            reconciler,
        }
    }

    fn running(h: &Harness) -> RecordId {
        let mut record = h
            .store
            .create_record(NewRecord::root("dcm2nii", "alice"))
            .unwrap();
        record.advance(ExecutionStatus::RunningOnRemote).unwrap();
        h.store.update_record(&record).unwrap();
        record.id
    }

    #[tokio::test]
    async fn finished_remote_registers_outputs_once() {
        let h = harness();
        let id = running(&h);
        let out = h.registrar.resolver().resolve(id).unwrap();
        fs::write(out.join("brain.nii"), "x").unwrap();
        h.mock.queue_status("finished-on-remote");

        let outcome = h.reconciler.poll(id).await.unwrap();
        match outcome {
            PollOutcome::Transitioned { from, to, registration, diagnostic } => {
                assert_eq!(from, ExecutionStatus::RunningOnRemote);
                assert_eq!(to, ExecutionStatus::FinishedOnRemote);
                assert_eq!(registration.added, 1);
                assert!(diagnostic.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let record = h.store.record(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::FinishedOnRemote);
        assert!(record.end_time.is_some());
        assert_eq!(h.store.result_files(id).len(), 1);
        assert!(h.mock.requests_for(JobAction::Search).is_empty());
    }

    #[tokio::test]
    async fn second_poll_after_finish_mutates_nothing() {
        let h = harness();
        let id = running(&h);
        h.mock.queue_status("finished-on-remote");
        h.reconciler.poll(id).await.unwrap();
        let events = h.log.len();

        let outcome = h.reconciler.poll(id).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Settled {
                status: ExecutionStatus::FinishedOnRemote
            }
        );
        assert_eq!(h.log.len(), events);
        assert_eq!(h.mock.requests_for(JobAction::Status).len(), 1);
    }

    #[tokio::test]
    async fn running_remote_leaves_record_alone() {
        let h = harness();
        let id = running(&h);
        h.mock.queue_status("running-on-remote");

        let outcome = h.reconciler.poll(id).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Unchanged {
                remote: "running-on-remote".into()
            }
        );
        assert_eq!(
            h.store.record(id).unwrap().status,
            ExecutionStatus::RunningOnRemote
        );
        assert!(h.log.filter_record(id).is_empty());
    }

    #[tokio::test]
    async fn repeated_running_polls_mutate_nothing() {
        let h = harness();
        let id = running(&h);
        let before = h.store.record(id).unwrap();
        h.mock
            .queue_status("running-on-remote")
            .queue_status("running-on-remote");

        for _ in 0..2 {
            assert_eq!(
                h.reconciler.poll(id).await.unwrap(),
                PollOutcome::Unchanged {
                    remote: "running-on-remote".into()
                }
            );
        }

        assert_eq!(h.store.record(id).unwrap(), before);
        assert!(h.log.filter_record(id).is_empty());
        assert!(h.store.result_files(id).is_empty());
        assert_eq!(h.mock.requests_for(JobAction::Status).len(), 2);
    }

    #[tokio::test]
    async fn finished_with_error_collects_diagnostic() {
        let h = harness();
        let id = running(&h);
        h.mock
            .queue_status("finishedWithError")
            .queue_json(json!({"d_ret": {"0": {"end": {"stderr": "segfault"}}}}))
            .queue_json(json!({"d_ret": {"0": {"end": {"returncode": 139}}}}));

        let outcome = h.reconciler.poll(id).await.unwrap();
        let diagnostic = match outcome {
            PollOutcome::Transitioned { to, diagnostic, .. } => {
                assert_eq!(to, ExecutionStatus::FinishedWithError);
                diagnostic.unwrap()
            }
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(
            diagnostic.lines(),
            vec!["stderr : segfault", "returncode : 139"]
        );

        let record = h.store.record(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::FinishedWithError);
        assert_eq!(record.diagnostic, Some(diagnostic));
        assert_eq!(h.mock.requests_for(JobAction::Search).len(), 2);
    }

    #[tokio::test]
    async fn unreachable_manager_defers() {
        let h = harness();
        let id = running(&h);
        h.mock.queue_error("connection refused");

        let outcome = h.reconciler.poll(id).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Deferred { .. }));
        assert_eq!(
            h.store.record(id).unwrap().status,
            ExecutionStatus::RunningOnRemote
        );
        assert_eq!(
            h.log.count(|k| matches!(k, EventKind::PollDeferred { .. })),
            1
        );
    }

    #[tokio::test]
    async fn malformed_status_defers() {
        let h = harness();
        let id = running(&h);
        h.mock.queue_json(json!({"d_ret": {"l_status": []}}));
        assert!(matches!(
            h.reconciler.poll(id).await.unwrap(),
            PollOutcome::Deferred { .. }
        ));

        h.mock.queue_status("finished-somehow");
        assert!(matches!(
            h.reconciler.poll(id).await.unwrap(),
            PollOutcome::Deferred { .. }
        ));
        assert!(h.store.result_files(id).is_empty());
    }

    #[tokio::test]
    async fn unknown_record_is_an_error() {
        let h = harness();
        assert!(matches!(
            h.reconciler.poll(404).await,
            Err(crate::error::CharmError::RecordNotFound { id: 404 })
        ));
    }

    #[tokio::test]
    async fn poll_all_covers_records_the_manager_may_run() {
        let h = harness();
        let a = running(&h);
        let b = running(&h);
        h.store
            .create_record(NewRecord::root("dcm2nii", "alice"))
            .unwrap();
        let mut unanswered = h
            .store
            .create_record(NewRecord::root("dcm2nii", "alice"))
            .unwrap();
        unanswered.mode = Some(ExecutionMode::Remote);
        h.store.update_record(&unanswered).unwrap();
        let h_mock = h.mock.as_ref().clone().with_default(json!({
            "d_ret": {"l_status": ["finished-on-remote"]}
        }));
        let reconciler = StatusReconciler::new(
            h.store.clone(),
            Arc::new(h_mock),
            h.registrar.clone(),
            h.log.clone(),
        );

        let results = reconciler.poll_all().await;
        let ids: Vec<_> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b, unanswered.id]);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Ok(PollOutcome::Transitioned { .. }))));
    }

    #[tokio::test]
    async fn concurrent_polls_transition_once() {
        let h = harness();
        let id = running(&h);
        let mock = MockJobManager::new().with_default(json!({
            "d_ret": {"l_status": ["finished-on-remote"]}
        }));
        let reconciler = StatusReconciler::new(
            h.store.clone(),
            Arc::new(mock),
            h.registrar.clone(),
            h.log.clone(),
        );

        let (first, second) = tokio::join!(reconciler.poll(id), reconciler.poll(id));
        let transitioned = [first.unwrap(), second.unwrap()]
            .iter()
            .filter(|o| matches!(o, PollOutcome::Transitioned { .. }))
            .count();
        assert_eq!(transitioned, 1);
        assert_eq!(
            h.log.count(|k| matches!(k, EventKind::StatusChanged { .. })),
            1
        );
    }
}
