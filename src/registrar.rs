//! Output file registration
//!
//! Walks a record's output directory (or the directory a local run was
//! pointed at) and records every regular file as a
//! [`ResultFile`] in the feed anchored at the chain's root. Re-running on an
//! unchanged directory adds nothing: the store keeps `(record, path)` unique.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::error::{CharmError, Result};
use crate::event_log::{EventKind, EventLog};
use crate::path::{ensure_dir, OutputPathResolver};
use crate::record::{RecordId, ResultFile};
use crate::store::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub output_dir: PathBuf,
    /// Regular files found on disk
    pub discovered: usize,
    /// Files newly recorded by this call
    pub added: usize,
}

#[derive(Clone)]
pub struct FileRegistrar {
    resolver: OutputPathResolver,
    store: Arc<dyn RecordStore>,
    event_log: EventLog,
}

impl FileRegistrar {
    pub fn new(resolver: OutputPathResolver, store: Arc<dyn RecordStore>, event_log: EventLog) -> Self {
        Self {
            resolver,
            store,
            event_log,
        }
    }

    pub fn resolver(&self) -> &OutputPathResolver {
        &self.resolver
    }

    /// Register the files under the record's resolved output path
    pub fn register(&self, id: RecordId) -> Result<Registration> {
        let chain = self.resolver.chain(id)?;
        let output_dir = self.resolver.path_for(&chain);
        self.register_in(id, &output_dir)
    }

    /// Register the files under `dir` for record `id`
    #[instrument(skip(self))]
    pub fn register_in(&self, id: RecordId, dir: &Path) -> Result<Registration> {
        let chain = self.resolver.chain(id)?;
        let output_dir = dir.to_path_buf();
        ensure_dir(&output_dir)?;

        let mut discovered = 0;
        let mut added = 0;
        for entry in WalkDir::new(&output_dir).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| output_dir.clone());
                CharmError::filesystem(path, e)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            discovered += 1;
            let file = ResultFile {
                record_id: id,
                feed_id: chain.feed.id,
                path: entry.into_path(),
            };
            if self.store.add_result_file(file)? {
                added += 1;
            }
        }

        if added > 0 {
            info!(record_id = id, added, discovered, "Registered output files");
        } else {
            debug!(record_id = id, discovered, "No new output files");
        }
        self.event_log.emit(EventKind::FilesRegistered {
            record_id: id,
            feed_id: chain.feed.id,
            discovered,
            added,
        });

        Ok(Registration {
            output_dir,
            discovered,
            added,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{NewRecord, PluginDescriptor, PluginKind};
    use crate::store::MemoryStore;
    use std::fs;

    fn setup() -> (tempfile::TempDir, Arc<MemoryStore>, FileRegistrar, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert_plugin(PluginDescriptor::new("dcm2nii", PluginKind::FilesystemRoot))
            .unwrap();
        store
            .insert_plugin(PluginDescriptor::new("freesurfer", PluginKind::DataProcessing))
            .unwrap();
        let log = EventLog::new();
        let resolver = OutputPathResolver::new(dir.path(), store.clone());
        let registrar = FileRegistrar::new(resolver, store.clone(), log.clone());
        (dir, store, registrar, log)
    }

    #[test]
    fn registers_nested_files_against_root_feed() {
        let (_dir, store, registrar, _log) = setup();
        let root = store.create_record(NewRecord::root("dcm2nii", "alice")).unwrap();
        let child = store
            .create_record(NewRecord::child("freesurfer", "alice", root.id))
            .unwrap();
        let out = registrar.resolver().resolve(child.id).unwrap();
        fs::create_dir_all(out.join("surf")).unwrap();
        fs::write(out.join("aseg.stats"), "x").unwrap();
        fs::write(out.join("surf").join("lh.white"), "y").unwrap();

        let reg = registrar.register(child.id).unwrap();
        assert_eq!(reg.discovered, 2);
        assert_eq!(reg.added, 2);

        let feed = store.feed_for_anchor(root.id).unwrap();
        let files = store.feed_files(feed.id);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.record_id == child.id));
        assert!(files.iter().any(|f| f.path.ends_with("surf/lh.white")));
    }

    #[test]
    fn re_registration_adds_nothing() {
        let (_dir, store, registrar, _log) = setup();
        let root = store.create_record(NewRecord::root("dcm2nii", "alice")).unwrap();
        let out = registrar.resolver().resolve(root.id).unwrap();
        fs::write(out.join("brain.nii"), "x").unwrap();

        assert_eq!(registrar.register(root.id).unwrap().added, 1);
        let again = registrar.register(root.id).unwrap();
        assert_eq!(again.discovered, 1);
        assert_eq!(again.added, 0);
        assert_eq!(store.result_files(root.id).len(), 1);
    }

    #[test]
    fn register_in_walks_the_given_directory() {
        let (dir, store, registrar, _log) = setup();
        let root = store.create_record(NewRecord::root("dcm2nii", "alice")).unwrap();
        let elsewhere = dir.path().join("scratch");
        fs::create_dir_all(&elsewhere).unwrap();
        fs::write(elsewhere.join("brain.nii"), "x").unwrap();

        let reg = registrar.register_in(root.id, &elsewhere).unwrap();
        assert_eq!(reg.output_dir, elsewhere);
        assert_eq!(reg.added, 1);
        let files = store.result_files(root.id);
        assert!(files[0].path.starts_with(&elsewhere));
        assert_eq!(files[0].feed_id, store.feed_for_anchor(root.id).unwrap().id);
    }

    #[test]
    fn empty_directory_is_created_and_registers_nothing() {
        let (_dir, store, registrar, log) = setup();
        let root = store.create_record(NewRecord::root("dcm2nii", "alice")).unwrap();
        let reg = registrar.register(root.id).unwrap();
        assert!(reg.output_dir.is_dir());
        assert_eq!(reg.discovered, 0);
        assert_eq!(log.filter_record(root.id).len(), 1);
    }
}
