//! Execution dispatch
//!
//! A record runs in one of three modes:
//!
//! | Mode | Blocks until | Registers files |
//! |------|--------------|-----------------|
//! | `in-process` | the plugin's entry point returns | yes, on return |
//! | `local-subprocess` | the child process exits | yes, on exit |
//! | `remote` | the job manager accepts the submission | no, deferred to the reconciler |
//!
//! Local modes register from the launch's output directory override when one
//! is given. Remote runs always use the resolved path.
//!
//! Local failures propagate to the caller and are persisted as a diagnostic.
//! Remote submission is fire-and-forget: a refused submission is logged and
//! the record stays `started`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandBuilder, CommandLine};
use crate::diagnostics::{Diagnostic, DiagnosticLine, STDERR_FIELD};
use crate::error::{CharmError, Result};
use crate::event_log::{EventKind, EventLog};
use crate::locks::RecordLocks;
use crate::params;
use crate::path::ensure_dir;
use crate::record::{ExecutionRecord, ExecutionStatus, NewRecord, RecordId};
use crate::registrar::{FileRegistrar, Registration};
use crate::remote::JobManager;
use crate::store::{require_plugin, require_record, RecordStore};

// ============================================================================
// MODES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[serde(rename = "in-process", alias = "internal")]
    InProcess,
    #[serde(rename = "local-subprocess", alias = "crunner")]
    LocalSubprocess,
    #[serde(rename = "remote", alias = "pman")]
    Remote,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::LocalSubprocess => "local-subprocess",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = CharmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "in-process" | "internal" => Ok(Self::InProcess),
            "local-subprocess" | "local" | "subprocess" | "crunner" => Ok(Self::LocalSubprocess),
            "remote" | "pman" => Ok(Self::Remote),
            other => Err(CharmError::config(format!(
                "unknown execution mode '{}' (expected internal, crunner or pman)",
                other
            ))),
        }
    }
}

// ============================================================================
// IN-PROCESS APPS
// ============================================================================

/// Entry point of a plugin that runs inside this process
#[async_trait]
pub trait PluginApp: Send + Sync {
    /// Run with the built argument list (executable excluded)
    async fn launch(&self, args: &[String]) -> anyhow::Result<()>;
}

/// Named in-process entry points
#[derive(Clone, Default)]
pub struct AppRegistry {
    apps: Arc<DashMap<String, Arc<dyn PluginApp>>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, app: Arc<dyn PluginApp>) {
        self.apps.insert(name.into(), app);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginApp>> {
        self.apps.get(name).map(|a| Arc::clone(a.value()))
    }
}

// ============================================================================
// LAUNCH CONFIG / OUTCOME
// ============================================================================

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Falls back to the dispatcher's default mode
    pub mode: Option<ExecutionMode>,
    pub input_dir: Option<PathBuf>,
    /// Falls back to the record's resolved output path
    pub output_dir: Option<PathBuf>,
    /// In-process app name; falls back to the plugin name
    pub app: Option<String>,
}

impl LaunchConfig {
    pub fn mode(mode: ExecutionMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = Some(dir.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Local run finished and outputs were registered
    Completed {
        registration: Registration,
        stdout: String,
    },
    /// Remote submission attempted; `accepted` is false if the job manager was unreachable
    Submitted { accepted: bool },
}

// ============================================================================
// DISPATCHER
// ============================================================================

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    registrar: FileRegistrar,
    manager: Arc<dyn JobManager>,
    apps: AppRegistry,
    event_log: EventLog,
    default_mode: ExecutionMode,
    local_timeout: Duration,
    locks: RecordLocks,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registrar: FileRegistrar,
        manager: Arc<dyn JobManager>,
        event_log: EventLog,
    ) -> Self {
        Self {
            store,
            registrar,
            manager,
            apps: AppRegistry::new(),
            event_log,
            default_mode: ExecutionMode::LocalSubprocess,
            local_timeout: Duration::from_secs(3600),
            locks: RecordLocks::new(),
        }
    }

    pub fn with_default_mode(mut self, mode: ExecutionMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = timeout;
        self
    }

    /// Share record locks with a reconciler
    pub fn with_locks(mut self, locks: RecordLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_apps(mut self, apps: AppRegistry) -> Self {
        self.apps = apps;
        self
    }

    pub fn apps(&self) -> &AppRegistry {
        &self.apps
    }

    /// Create a record and bind its parameters
    ///
    /// Parameters are validated before the record is persisted.
    pub fn submit(&self, new: NewRecord, raw: &BTreeMap<String, String>) -> Result<ExecutionRecord> {
        let plugin = require_plugin(self.store.as_ref(), &new.plugin)?;
        let values = params::bind(&plugin, raw)?;
        let record = self.store.create_record(new)?;
        self.store.set_parameters(record.id, values)?;
        info!(record_id = record.id, plugin = %record.plugin, owner = %record.owner.username, "Created execution record");
        Ok(record)
    }

    /// Directory the plugin writes to and the files are registered from
    pub fn output_dir_for(&self, id: RecordId, launch: &LaunchConfig) -> Result<PathBuf> {
        match &launch.output_dir {
            Some(dir) => Ok(dir.clone()),
            None => self.registrar.resolver().resolve(id),
        }
    }

    /// Assemble the invocation for a record
    pub fn command_for(&self, id: RecordId, launch: &LaunchConfig) -> Result<CommandLine> {
        let output_dir = self.output_dir_for(id, launch)?;
        self.build_command(id, launch, &output_dir)
    }

    fn build_command(
        &self,
        id: RecordId,
        launch: &LaunchConfig,
        output_dir: &Path,
    ) -> Result<CommandLine> {
        let record = require_record(self.store.as_ref(), id)?;
        let plugin = require_plugin(self.store.as_ref(), &record.plugin)?;
        CommandBuilder::new(&plugin)
            .parameters(&self.store.parameters(id))
            .input_dir(launch.input_dir.as_deref())
            .output_dir(Some(output_dir))
            .build()
    }

    #[instrument(skip(self, launch), fields(mode = tracing::field::Empty))]
    pub async fn run(&self, id: RecordId, launch: &LaunchConfig) -> Result<DispatchOutcome> {
        let _guard = self.locks.lock(id).await;

        let mut record = require_record(self.store.as_ref(), id)?;
        if record.status != ExecutionStatus::Started {
            return Err(CharmError::InvalidTransition {
                id,
                from: record.status.to_string(),
                to: ExecutionStatus::Started.to_string(),
            });
        }

        let mode = launch.mode.unwrap_or(self.default_mode);
        tracing::Span::current().record("mode", mode.as_str());
        if mode == ExecutionMode::Remote && launch.output_dir.is_some() {
            // The reconciler registers remote outputs from the resolved path
            return Err(CharmError::validation(
                "an output directory override is not supported for remote runs",
            ));
        }
        let output_dir = self.output_dir_for(id, launch)?;
        ensure_dir(&output_dir)?;
        let command = self.build_command(id, launch, &output_dir)?;

        record.mode = Some(mode);
        self.store.update_record(&record)?;
        info!(record_id = id, %mode, command = %command, "Dispatching");
        self.event_log.emit(EventKind::Dispatched {
            record_id: id,
            mode,
            argv: command.argv(),
        });

        match mode {
            ExecutionMode::InProcess => {
                self.run_in_process(record, launch, &command, &output_dir)
                    .await
            }
            ExecutionMode::LocalSubprocess => {
                self.run_subprocess(record, &command, &output_dir).await
            }
            ExecutionMode::Remote => self.run_remote(record, &command).await,
        }
    }

    async fn run_in_process(
        &self,
        record: ExecutionRecord,
        launch: &LaunchConfig,
        command: &CommandLine,
        output_dir: &Path,
    ) -> Result<DispatchOutcome> {
        let name = launch.app.as_deref().unwrap_or(&record.plugin);
        let app = self.apps.get(name).ok_or_else(|| {
            CharmError::config(format!("no in-process app registered as '{}'", name))
        })?;

        if let Err(e) = app.launch(&command.args).await {
            let diagnostic = Diagnostic {
                stderr: Some(DiagnosticLine::new(STDERR_FIELD, format!("{:#}", e))),
                returncode: None,
                collected: chrono::Utc::now(),
            };
            return Err(self.fail(record, diagnostic, format!("{:#}", e)));
        }

        let registration = self.registrar.register_in(record.id, output_dir)?;
        self.finish(record, ExecutionStatus::FinishedOnRemote)?;
        Ok(DispatchOutcome::Completed {
            registration,
            stdout: String::new(),
        })
    }

    async fn run_subprocess(
        &self,
        record: ExecutionRecord,
        command: &CommandLine,
        output_dir: &Path,
    ) -> Result<DispatchOutcome> {
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.local_timeout, child).await {
            Err(_) => {
                let reason = format!("timed out after {}s", self.local_timeout.as_secs());
                return Err(self.fail(record, Diagnostic::local(&reason, None), reason));
            }
            Ok(Err(e)) => {
                let reason = format!("failed to spawn '{}': {}", command.program, e);
                return Err(self.fail(record, Diagnostic::local(&reason, None), reason));
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(record_id = record.id, stdout = %stdout.trim_end(), stderr = %stderr.trim_end(), "Child exited");

        let registration = self.registrar.register_in(record.id, output_dir)?;

        if !output.status.success() {
            let reason = format!("exited with {}", output.status);
            return Err(self.fail(record, Diagnostic::local(&stderr, output.status.code()), reason));
        }

        self.finish(record, ExecutionStatus::FinishedOnRemote)?;
        Ok(DispatchOutcome::Completed {
            registration,
            stdout,
        })
    }

    async fn run_remote(
        &self,
        mut record: ExecutionRecord,
        command: &CommandLine,
    ) -> Result<DispatchOutcome> {
        match self.manager.submit(&record, command).await {
            Ok(response) => {
                self.event_log.emit(EventKind::RemoteSubmitted {
                    record_id: record.id,
                    accepted: true,
                    response: response.body().clone(),
                });
                let from = record.status;
                record.advance(ExecutionStatus::RunningOnRemote)?;
                self.store.update_record(&record)?;
                self.event_log.emit(EventKind::StatusChanged {
                    record_id: record.id,
                    from,
                    to: record.status,
                });
                info!(record_id = record.id, "Submitted to job manager");
                Ok(DispatchOutcome::Submitted { accepted: true })
            }
            Err(e) => {
                warn!(record_id = record.id, error = %e, "Job manager did not accept submission");
                self.event_log.emit(EventKind::RemoteSubmitted {
                    record_id: record.id,
                    accepted: false,
                    response: json!({ "error": e.to_string() }),
                });
                Ok(DispatchOutcome::Submitted { accepted: false })
            }
        }
    }

    fn finish(&self, mut record: ExecutionRecord, status: ExecutionStatus) -> Result<()> {
        let from = record.status;
        record.advance(status)?;
        self.store.update_record(&record)?;
        self.event_log.emit(EventKind::StatusChanged {
            record_id: record.id,
            from,
            to: status,
        });
        Ok(())
    }

    /// Persist a local failure and build the error returned to the caller
    fn fail(&self, mut record: ExecutionRecord, diagnostic: Diagnostic, reason: String) -> CharmError {
        let id = record.id;
        warn!(record_id = id, reason = %reason, "Local execution failed");
        record.diagnostic = Some(diagnostic);
        if let Err(e) = self.finish(record, ExecutionStatus::FinishedWithError) {
            warn!(record_id = id, error = %e, "Could not persist failure status");
        }
        self.event_log.emit(EventKind::ExecutionFailed {
            record_id: id,
            error: reason.clone(),
        });
        CharmError::Execution { id, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_legacy_names() {
        assert_eq!("internal".parse::<ExecutionMode>().unwrap(), ExecutionMode::InProcess);
        assert_eq!("crunner".parse::<ExecutionMode>().unwrap(), ExecutionMode::LocalSubprocess);
        assert_eq!("PMAN".parse::<ExecutionMode>().unwrap(), ExecutionMode::Remote);
        assert!("docker".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn modes_serialize_kebab_case() {
        assert_eq!(
            serde_json::to_value(ExecutionMode::LocalSubprocess).unwrap(),
            "local-subprocess"
        );
        let mode: ExecutionMode = serde_yaml::from_str("pman").unwrap();
        assert_eq!(mode, ExecutionMode::Remote);
    }

    #[test]
    fn launch_config_builders() {
        let launch = LaunchConfig::mode(ExecutionMode::Remote)
            .with_input_dir("/in")
            .with_app("echo");
        assert_eq!(launch.mode, Some(ExecutionMode::Remote));
        assert_eq!(launch.input_dir, Some(PathBuf::from("/in")));
        assert_eq!(launch.app.as_deref(), Some("echo"));
    }
}
