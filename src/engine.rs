//! Component wiring
//!
//! Builds the shared store, event log, resolver, registrar, dispatcher and
//! reconciler from a [`CharmConfig`] and a job manager. The dispatcher and
//! reconciler share one set of per-record locks.

use std::sync::Arc;

use tracing::debug;

use crate::config::CharmConfig;
use crate::dispatch::{AppRegistry, Dispatcher};
use crate::error::Result;
use crate::event_log::EventLog;
use crate::locks::RecordLocks;
use crate::path::OutputPathResolver;
use crate::reconcile::StatusReconciler;
use crate::registrar::FileRegistrar;
use crate::remote::{JobManager, PmanClient};
use crate::store::{MemoryStore, RecordStore};

pub struct Engine {
    config: CharmConfig,
    store: Arc<MemoryStore>,
    event_log: EventLog,
    registrar: FileRegistrar,
    dispatcher: Dispatcher,
    reconciler: StatusReconciler,
}

impl Engine {
    /// Engine talking to the configured job manager over HTTP
    pub fn new(config: CharmConfig, store: Arc<MemoryStore>) -> Result<Self> {
        config.validate()?;
        let client = PmanClient::new(&config.remote)?;
        debug!(endpoint = %client.endpoint(), "Job manager client ready");
        Ok(Self::with_manager(config, store, Arc::new(client)))
    }

    pub fn with_manager(
        config: CharmConfig,
        store: Arc<MemoryStore>,
        manager: Arc<dyn JobManager>,
    ) -> Self {
        let event_log = EventLog::new();
        let locks = RecordLocks::new();
        let records: Arc<dyn RecordStore> = store.clone();
        let resolver = OutputPathResolver::new(config.storage_root.clone(), Arc::clone(&records));
        debug!(storage_root = %resolver.storage_root().display(), "Output paths resolve under storage root");
        let registrar = FileRegistrar::new(resolver, Arc::clone(&records), event_log.clone());
        let dispatcher = Dispatcher::new(
            Arc::clone(&records),
            registrar.clone(),
            Arc::clone(&manager),
            event_log.clone(),
        )
        .with_default_mode(config.default_mode)
        .with_local_timeout(config.local.timeout())
        .with_locks(locks.clone());
        let reconciler =
            StatusReconciler::new(records, manager, registrar.clone(), event_log.clone())
                .with_locks(locks);

        Self {
            config,
            store,
            event_log,
            registrar,
            dispatcher,
            reconciler,
        }
    }

    pub fn with_apps(mut self, apps: AppRegistry) -> Self {
        self.dispatcher = self.dispatcher.with_apps(apps);
        self
    }

    pub fn config(&self) -> &CharmConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn resolver(&self) -> &OutputPathResolver {
        self.registrar.resolver()
    }

    pub fn registrar(&self) -> &FileRegistrar {
        &self.registrar
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &StatusReconciler {
        &self.reconciler
    }
}
