//! Output path resolution
//!
//! A record's output directory is derived from its chain of parents:
//!
//! ```text
//! <storage_root>/<owner>/feed_<feed_id>/<root>_<id>/[<plugin>_<id>/...]/<leaf>_<id>/data
//! ```
//!
//! One segment per chain node, root first, `data` only at the leaf.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{CharmError, Result};
use crate::record::{ExecutionRecord, PluginDescriptor, RecordId, ResultCollection};
use crate::store::{require_plugin, require_record, RecordStore};

/// One node of a resolved chain
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub record: ExecutionRecord,
    pub plugin: PluginDescriptor,
}

impl ChainLink {
    pub fn segment(&self) -> String {
        format!("{}_{}", self.plugin.name, self.record.id)
    }
}

/// Chain from the filesystem-root record down to a leaf
#[derive(Debug, Clone)]
pub struct Chain {
    /// Root first, leaf last
    pub links: Vec<ChainLink>,
    /// Feed anchored at the root
    pub feed: ResultCollection,
}

impl Chain {
    pub fn root(&self) -> &ChainLink {
        &self.links[0]
    }

    pub fn leaf(&self) -> &ChainLink {
        &self.links[self.links.len() - 1]
    }

    /// `<root>_<id>/.../<leaf>_<id>/data`
    pub fn relative_path(&self) -> PathBuf {
        let mut path: PathBuf = self.links.iter().map(ChainLink::segment).collect();
        path.push("data");
        path
    }
}

#[derive(Clone)]
pub struct OutputPathResolver {
    storage_root: PathBuf,
    store: Arc<dyn RecordStore>,
}

impl OutputPathResolver {
    pub fn new(storage_root: impl Into<PathBuf>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            storage_root: storage_root.into(),
            store,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Walk parent links from `id` up to the filesystem-root record
    pub fn chain(&self, id: RecordId) -> Result<Chain> {
        let mut links = Vec::new();
        let mut seen = HashSet::new();
        let mut current = require_record(self.store.as_ref(), id)?;

        loop {
            if !seen.insert(current.id) {
                return Err(CharmError::BrokenChain {
                    id,
                    reason: format!("cycle through record {}", current.id),
                });
            }
            let plugin = require_plugin(self.store.as_ref(), &current.plugin)?;
            let is_root = plugin.is_root();
            let parent = current.parent;
            links.push(ChainLink {
                record: current,
                plugin,
            });
            if is_root {
                break;
            }
            let parent = parent.ok_or_else(|| CharmError::BrokenChain {
                id,
                reason: "chain ends without a filesystem-root record".to_string(),
            })?;
            current = self
                .store
                .record(parent)
                .ok_or_else(|| CharmError::BrokenChain {
                    id,
                    reason: format!("parent record {} is missing", parent),
                })?;
        }
        links.reverse();

        let anchor = links[0].record.id;
        let feed = self
            .store
            .feed_for_anchor(anchor)
            .ok_or_else(|| CharmError::BrokenChain {
                id,
                reason: format!("root record {} has no feed", anchor),
            })?;
        Ok(Chain { links, feed })
    }

    /// Output directory for `id` without touching the filesystem
    pub fn output_path(&self, id: RecordId) -> Result<PathBuf> {
        let chain = self.chain(id)?;
        Ok(self.path_for(&chain))
    }

    pub fn path_for(&self, chain: &Chain) -> PathBuf {
        self.storage_root
            .join(&chain.leaf().record.owner.username)
            .join(format!("feed_{}", chain.feed.id))
            .join(chain.relative_path())
    }

    /// Output directory for `id`, created if absent
    pub fn resolve(&self, id: RecordId) -> Result<PathBuf> {
        let path = self.output_path(id)?;
        ensure_dir(&path)?;
        debug!(record_id = id, path = %path.display(), "Resolved output path");
        Ok(path)
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| CharmError::filesystem(path, e))
}
