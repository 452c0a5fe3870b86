//! Charm - plugin execution dispatch and status reconciliation

pub mod command;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod locks;
pub mod params;
pub mod path;
pub mod reconcile;
pub mod record;
pub mod registrar;
pub mod remote;
pub mod store;

pub use command::{CommandBuilder, CommandLine};
pub use config::CharmConfig;
pub use diagnostics::{Diagnostic, DiagnosticLine, ErrorCollector};
pub use dispatch::{
    AppRegistry, DispatchOutcome, Dispatcher, ExecutionMode, LaunchConfig, PluginApp,
};
pub use engine::Engine;
pub use error::{CharmError, FixSuggestion};
pub use event_log::{Event, EventKind, EventLog};
pub use locks::RecordLocks;
pub use params::{ParameterDefinition, ParameterType, ParameterValue, TypedValue};
pub use path::OutputPathResolver;
pub use reconcile::{PollOutcome, StatusReconciler};
pub use record::{
    ExecutionRecord, ExecutionStatus, NewRecord, Owner, PluginDescriptor, PluginKind, RecordId,
};
pub use registrar::{FileRegistrar, Registration};
pub use remote::{JobManager, MockJobManager, PmanClient};
pub use store::{MemoryStore, RecordStore};
