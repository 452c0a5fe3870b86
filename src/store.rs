//! Record storage
//!
//! [`RecordStore`] is the persistence seam: plain create/read/update with
//! the few integrity rules the engine relies on (chain shape, monotonic
//! status, one feed per root, unique `(record, path)` result files).
//! [`MemoryStore`] is the DashMap-backed implementation; it round-trips
//! through a YAML [`StoreSnapshot`] for the CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CharmError, Result};
use crate::params::{validate_name, ParameterValue};
use crate::record::{
    ExecutionRecord, ExecutionStatus, FeedId, NewRecord, PluginDescriptor, PluginKind, RecordId,
    ResultCollection, ResultFile,
};

pub trait RecordStore: Send + Sync {
    fn insert_plugin(&self, plugin: PluginDescriptor) -> Result<()>;

    fn plugin(&self, name: &str) -> Option<PluginDescriptor>;

    /// Persist a new record (status `started`). Creates the feed when the
    /// record's plugin is a filesystem-root plugin.
    fn create_record(&self, new: NewRecord) -> Result<ExecutionRecord>;

    fn record(&self, id: RecordId) -> Option<ExecutionRecord>;

    fn records(&self) -> Vec<ExecutionRecord>;

    /// Persist status, end time, mode and diagnostic. Chain fields are immutable.
    fn update_record(&self, record: &ExecutionRecord) -> Result<()>;

    fn set_parameters(&self, id: RecordId, values: Vec<ParameterValue>) -> Result<()>;

    fn parameters(&self, id: RecordId) -> Vec<ParameterValue>;

    fn feed(&self, id: FeedId) -> Option<ResultCollection>;

    fn feed_for_anchor(&self, anchor: RecordId) -> Option<ResultCollection>;

    /// Returns `false` if `(record_id, path)` was already registered
    fn add_result_file(&self, file: ResultFile) -> Result<bool>;

    fn result_files(&self, id: RecordId) -> Vec<ResultFile>;

    fn feed_files(&self, feed: FeedId) -> Vec<ResultFile>;
}

pub fn require_record(store: &dyn RecordStore, id: RecordId) -> Result<ExecutionRecord> {
    store.record(id).ok_or(CharmError::RecordNotFound { id })
}

pub fn require_plugin(store: &dyn RecordStore, name: &str) -> Result<PluginDescriptor> {
    store.plugin(name).ok_or_else(|| CharmError::PluginNotFound {
        name: name.to_string(),
    })
}

// ═══════════════════════════════════════════
// SNAPSHOT
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    #[serde(default)]
    pub records: Vec<ExecutionRecord>,
    #[serde(default)]
    pub parameters: BTreeMap<RecordId, Vec<ParameterValue>>,
    #[serde(default)]
    pub feeds: Vec<ResultCollection>,
    #[serde(default)]
    pub files: Vec<ResultFile>,
    #[serde(default)]
    pub next_record_id: RecordId,
    #[serde(default)]
    pub next_feed_id: FeedId,
}

// ═══════════════════════════════════════════
// MEMORY STORE
// ═══════════════════════════════════════════

/// Thread-safe in-memory store (lock-free maps)
#[derive(Clone, Default)]
pub struct MemoryStore {
    plugins: Arc<DashMap<String, PluginDescriptor>>,
    records: Arc<DashMap<RecordId, ExecutionRecord>>,
    parameters: Arc<DashMap<RecordId, Vec<ParameterValue>>>,
    feeds: Arc<DashMap<FeedId, ResultCollection>>,
    feed_by_anchor: Arc<DashMap<RecordId, FeedId>>,
    files: Arc<DashMap<(RecordId, PathBuf), ResultFile>>,
    next_record_id: Arc<AtomicU64>,
    next_feed_id: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        for p in snapshot.plugins {
            store.plugins.insert(p.name.clone(), p);
        }
        let mut max_record = 0;
        for r in snapshot.records {
            max_record = max_record.max(r.id);
            store.records.insert(r.id, r);
        }
        for (id, values) in snapshot.parameters {
            store.parameters.insert(id, values);
        }
        let mut max_feed = 0;
        for f in snapshot.feeds {
            max_feed = max_feed.max(f.id);
            store.feed_by_anchor.insert(f.anchor, f.id);
            store.feeds.insert(f.id, f);
        }
        for f in snapshot.files {
            store.files.insert((f.record_id, f.path.clone()), f);
        }
        store
            .next_record_id
            .store(snapshot.next_record_id.max(max_record), Ordering::SeqCst);
        store
            .next_feed_id
            .store(snapshot.next_feed_id.max(max_feed), Ordering::SeqCst);
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut plugins: Vec<_> = self.plugins.iter().map(|e| e.value().clone()).collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        let mut feeds: Vec<_> = self.feeds.iter().map(|e| e.value().clone()).collect();
        feeds.sort_by_key(|f| f.id);
        let mut files: Vec<_> = self.files.iter().map(|e| e.value().clone()).collect();
        files.sort_by(|a, b| (a.record_id, &a.path).cmp(&(b.record_id, &b.path)));

        StoreSnapshot {
            plugins,
            records: self.records(),
            parameters: self
                .parameters
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            feeds,
            files,
            next_record_id: self.next_record_id.load(Ordering::SeqCst),
            next_feed_id: self.next_feed_id.load(Ordering::SeqCst),
        }
    }

    /// Load a snapshot file; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let yaml = std::fs::read_to_string(path)?;
        let snapshot: StoreSnapshot = serde_yaml::from_str(&yaml)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| CharmError::filesystem(dir, e))?;
        }
        std::fs::write(path, serde_yaml::to_string(&self.snapshot())?)?;
        Ok(())
    }

    fn create_feed(&self, record: &ExecutionRecord) -> ResultCollection {
        let id = self.next_feed_id.fetch_add(1, Ordering::SeqCst) + 1;
        let feed = ResultCollection {
            id,
            anchor: record.id,
            owner: record.owner.clone(),
            created: Utc::now(),
        };
        self.feeds.insert(id, feed.clone());
        self.feed_by_anchor.insert(record.id, id);
        debug!(record_id = record.id, feed_id = id, "Created feed");
        feed
    }
}

impl RecordStore for MemoryStore {
    fn insert_plugin(&self, plugin: PluginDescriptor) -> Result<()> {
        validate_name("plugin", &plugin.name)?;
        for p in &plugin.parameters {
            validate_name("parameter", &p.name)?;
        }
        self.plugins.insert(plugin.name.clone(), plugin);
        Ok(())
    }

    fn plugin(&self, name: &str) -> Option<PluginDescriptor> {
        self.plugins.get(name).map(|p| p.clone())
    }

    fn create_record(&self, new: NewRecord) -> Result<ExecutionRecord> {
        // The owner's username is the first path segment below the storage root
        validate_name("owner", &new.owner.username)?;
        let plugin = require_plugin(self, &new.plugin)?;

        match (plugin.kind, new.parent) {
            (PluginKind::FilesystemRoot, Some(_)) => {
                return Err(CharmError::validation(format!(
                    "filesystem-root plugin '{}' cannot have a parent",
                    plugin.name
                )))
            }
            (PluginKind::DataProcessing, None) => {
                return Err(CharmError::validation(format!(
                    "data-processing plugin '{}' requires a parent record",
                    plugin.name
                )))
            }
            (_, Some(parent)) if !self.records.contains_key(&parent) => {
                return Err(CharmError::RecordNotFound { id: parent })
            }
            _ => {}
        }

        let id = self.next_record_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ExecutionRecord {
            id,
            status: ExecutionStatus::Started,
            start_time: Utc::now(),
            end_time: None,
            parent: new.parent,
            plugin: new.plugin,
            owner: new.owner,
            mode: None,
            diagnostic: None,
        };
        self.records.insert(id, record.clone());

        if plugin.is_root() && !self.feed_by_anchor.contains_key(&id) {
            self.create_feed(&record);
        }
        Ok(record)
    }

    fn record(&self, id: RecordId) -> Option<ExecutionRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    fn records(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = self.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    fn update_record(&self, record: &ExecutionRecord) -> Result<()> {
        let mut stored = self
            .records
            .get_mut(&record.id)
            .ok_or(CharmError::RecordNotFound { id: record.id })?;

        if stored.parent != record.parent
            || stored.plugin != record.plugin
            || stored.owner != record.owner
        {
            return Err(CharmError::BrokenChain {
                id: record.id,
                reason: "parent, plugin and owner are immutable".to_string(),
            });
        }
        if stored.status != record.status && !stored.status.can_transition_to(record.status) {
            return Err(CharmError::InvalidTransition {
                id: record.id,
                from: stored.status.to_string(),
                to: record.status.to_string(),
            });
        }
        *stored = record.clone();
        Ok(())
    }

    fn set_parameters(&self, id: RecordId, values: Vec<ParameterValue>) -> Result<()> {
        if !self.records.contains_key(&id) {
            return Err(CharmError::RecordNotFound { id });
        }
        match self.parameters.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CharmError::validation(format!(
                "parameters of record {} are already bound",
                id
            ))),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(values);
                Ok(())
            }
        }
    }

    fn parameters(&self, id: RecordId) -> Vec<ParameterValue> {
        self.parameters
            .get(&id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    fn feed(&self, id: FeedId) -> Option<ResultCollection> {
        self.feeds.get(&id).map(|f| f.clone())
    }

    fn feed_for_anchor(&self, anchor: RecordId) -> Option<ResultCollection> {
        let id = *self.feed_by_anchor.get(&anchor)?;
        self.feed(id)
    }

    fn add_result_file(&self, file: ResultFile) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        if !self.records.contains_key(&file.record_id) {
            return Err(CharmError::RecordNotFound { id: file.record_id });
        }
        match self.files.entry((file.record_id, file.path.clone())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(e) => {
                e.insert(file);
                Ok(true)
            }
        }
    }

    fn result_files(&self, id: RecordId) -> Vec<ResultFile> {
        let mut files: Vec<_> = self
            .files
            .iter()
            .filter(|e| e.key().0 == id)
            .map(|e| e.value().clone())
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    fn feed_files(&self, feed: FeedId) -> Vec<ResultFile> {
        let mut files: Vec<_> = self
            .files
            .iter()
            .filter(|e| e.value().feed_id == feed)
            .map(|e| e.value().clone())
            .collect();
        files.sort_by(|a, b| (a.record_id, &a.path).cmp(&(b.record_id, &b.path)));
        files
    }
}
