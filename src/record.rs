//! Execution records and the data they hang off
//!
//! - [`ExecutionRecord`]: one run of a plugin, linked to the run that triggered it
//! - [`PluginDescriptor`]: catalog entry (kind, executable, parameter schema)
//! - [`ExecutionStatus`]: forward-only lifecycle
//! - [`ResultCollection`] / [`ResultFile`]: the feed and its registered outputs

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostic;
use crate::dispatch::ExecutionMode;
use crate::error::{CharmError, Result};
use crate::params::ParameterDefinition;

pub type RecordId = u64;
pub type FeedId = u64;

// ═══════════════════════════════════════════
// PLUGINS
// ═══════════════════════════════════════════

/// Plugin kind. `fs` plugins anchor a new feed, `ds` plugins consume a parent's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    #[serde(rename = "fs", alias = "filesystem-root")]
    FilesystemRoot,
    #[serde(rename = "ds", alias = "data-processing")]
    DataProcessing,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FilesystemRoot => "fs",
            Self::DataProcessing => "ds",
        }
    }
}

/// Catalog entry describing a runnable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    /// Directory holding the executable
    #[serde(default)]
    pub selfpath: String,
    /// Executable file name inside `selfpath`
    #[serde(default)]
    pub selfexec: String,
    /// Interpreter token prepended to the executable (e.g. `python3`)
    #[serde(default)]
    pub execshell: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, kind: PluginKind) -> Self {
        Self {
            name: name.into(),
            kind,
            selfpath: String::new(),
            selfexec: String::new(),
            execshell: String::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_executable(mut self, selfpath: impl Into<String>, selfexec: impl Into<String>) -> Self {
        self.selfpath = selfpath.into();
        self.selfexec = selfexec.into();
        self
    }

    pub fn with_shell(mut self, execshell: impl Into<String>) -> Self {
        self.execshell = execshell.into();
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterDefinition) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn is_root(&self) -> bool {
        self.kind == PluginKind::FilesystemRoot
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDefinition> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

// ═══════════════════════════════════════════
// STATUS
// ═══════════════════════════════════════════

/// Lifecycle of an execution record
///
/// `started → running-on-remote → {finished-on-remote | finishedWithError}`.
/// Local runs may jump from `started` straight to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "running-on-remote")]
    RunningOnRemote,
    #[serde(rename = "finished-on-remote")]
    FinishedOnRemote,
    #[serde(rename = "finishedWithError")]
    FinishedWithError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::RunningOnRemote => "running-on-remote",
            Self::FinishedOnRemote => "finished-on-remote",
            Self::FinishedWithError => "finishedWithError",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Started => 0,
            Self::RunningOnRemote => 1,
            Self::FinishedOnRemote | Self::FinishedWithError => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = CharmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(Self::Started),
            "running-on-remote" => Ok(Self::RunningOnRemote),
            "finished-on-remote" => Ok(Self::FinishedOnRemote),
            "finishedWithError" => Ok(Self::FinishedWithError),
            other => Err(CharmError::validation(format!("unknown status '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub username: String,
}

impl Owner {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// One concrete run of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RecordId,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Triggering record; never reassigned after creation
    #[serde(default)]
    pub parent: Option<RecordId>,
    /// Plugin name (key into the plugin catalog)
    pub plugin: String,
    pub owner: Owner,
    /// How the record was last dispatched
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    /// stderr/returncode captured on failure
    #[serde(default)]
    pub diagnostic: Option<Diagnostic>,
}

impl ExecutionRecord {
    /// Move the record forward. Returns `Ok(false)` when already in `next`.
    pub fn advance(&mut self, next: ExecutionStatus) -> Result<bool> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(CharmError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(true)
    }
}

/// Input to [`RecordStore::create_record`](crate::store::RecordStore::create_record)
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub plugin: String,
    pub owner: Owner,
    pub parent: Option<RecordId>,
}

impl NewRecord {
    pub fn root(plugin: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            owner: Owner::new(owner),
            parent: None,
        }
    }

    pub fn child(plugin: impl Into<String>, owner: impl Into<String>, parent: RecordId) -> Self {
        Self {
            plugin: plugin.into(),
            owner: Owner::new(owner),
            parent: Some(parent),
        }
    }
}

// ═══════════════════════════════════════════
// FEEDS
// ═══════════════════════════════════════════

/// Result collection ("feed") anchored by exactly one filesystem-root record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCollection {
    pub id: FeedId,
    pub anchor: RecordId,
    pub owner: Owner,
    pub created: DateTime<Utc>,
}

/// A registered output artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultFile {
    pub record_id: RecordId,
    pub feed_id: FeedId,
    pub path: PathBuf,
}
