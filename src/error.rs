//! Error types with fix suggestions

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

pub type Result<T> = std::result::Result<T, CharmError>;

#[derive(Error, Debug)]
pub enum CharmError {
    // ─────────────────────────────────────────────────────────────
    // Configuration / validation (CHARM-010 to CHARM-019)
    // ─────────────────────────────────────────────────────────────
    #[error("CHARM-010: Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("CHARM-011: Validation error: {reason}")]
    Validation { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Store / chain errors (CHARM-020 to CHARM-029)
    // ─────────────────────────────────────────────────────────────
    #[error("CHARM-020: Execution record {id} not found")]
    RecordNotFound { id: u64 },

    #[error("CHARM-021: Plugin '{name}' not found")]
    PluginNotFound { name: String },

    #[error("CHARM-022: Broken chain at record {id}: {reason}")]
    BrokenChain { id: u64, reason: String },

    #[error("CHARM-023: Record {id} cannot move from '{from}' to '{to}'")]
    InvalidTransition { id: u64, from: String, to: String },

    // ─────────────────────────────────────────────────────────────
    // Execution errors (CHARM-030 to CHARM-039)
    // ─────────────────────────────────────────────────────────────
    #[error("CHARM-030: Filesystem error at '{path}': {reason}")]
    Filesystem { path: String, reason: String },

    #[error("CHARM-031: Execution of record {id} failed: {reason}")]
    Execution { id: u64, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Remote job manager errors (CHARM-040 to CHARM-049)
    // ─────────────────────────────────────────────────────────────
    #[error("CHARM-040: Remote communication failed: {reason}")]
    RemoteCommunication { reason: String },

    #[error("CHARM-041: Remote job {id} finished with error")]
    RemoteJob { id: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CharmError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn remote(reason: impl Into<String>) -> Self {
        Self::RemoteCommunication {
            reason: reason.into(),
        }
    }

    pub fn filesystem(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        Self::Filesystem {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Transient errors leave local state untouched and may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteCommunication { .. })
    }
}

impl FixSuggestion for CharmError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            CharmError::Configuration { .. } => {
                Some("Check the plugin's selfpath/selfexec and the config file values")
            }
            CharmError::Validation { .. } => {
                Some("Check parameter names and that each value parses as its declared type")
            }
            CharmError::RecordNotFound { .. } => Some("List records with `charm show <id>`"),
            CharmError::PluginNotFound { .. } => Some("Register the plugin with `charm plugin add`"),
            CharmError::BrokenChain { .. } => {
                Some("Every data-processing record needs a parent chain ending at a filesystem-root record")
            }
            CharmError::InvalidTransition { .. } => {
                Some("Status only moves forward: started → running-on-remote → finished")
            }
            CharmError::Filesystem { .. } => Some("Check storage_root exists and is writable"),
            CharmError::Execution { .. } => {
                Some("Inspect the recorded stderr/returncode with `charm show <id>`")
            }
            CharmError::RemoteCommunication { .. } => {
                Some("Check the job manager is reachable at remote.host:remote.port")
            }
            CharmError::RemoteJob { .. } => {
                Some("Inspect the collected diagnostic with `charm show <id>`")
            }
            CharmError::Io(_) => Some("Check file path and permissions"),
            CharmError::Json(_) => {
                Some("Encoding the outgoing message failed; check the record's parameter values")
            }
            CharmError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_are_transient() {
        assert!(CharmError::remote("connection refused").is_transient());
        assert!(!CharmError::RemoteJob { id: 3 }.is_transient());
        assert!(!CharmError::config("no exec").is_transient());
    }

    #[test]
    fn every_variant_has_a_suggestion() {
        let errors = vec![
            CharmError::config("x"),
            CharmError::validation("x"),
            CharmError::RecordNotFound { id: 1 },
            CharmError::PluginNotFound { name: "p".into() },
            CharmError::BrokenChain {
                id: 1,
                reason: "x".into(),
            },
            CharmError::filesystem("/tmp", "denied"),
            CharmError::remote("x"),
        ];
        for e in errors {
            assert!(e.fix_suggestion().is_some(), "{e}");
        }
    }

    #[test]
    fn json_hint_points_at_local_encoding() {
        let e: CharmError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        let hint = e.fix_suggestion().unwrap();
        assert!(hint.contains("Encoding"));
        assert!(!hint.contains("returned"));
        // Malformed replies are communication errors, not Json
        assert!(matches!(
            crate::remote::JobResponse::parse("<html>"),
            Err(CharmError::RemoteCommunication { .. })
        ));
    }

    #[test]
    fn display_includes_code() {
        let e = CharmError::InvalidTransition {
            id: 4,
            from: "finished-on-remote".into(),
            to: "started".into(),
        };
        assert_eq!(
            e.to_string(),
            "CHARM-023: Record 4 cannot move from 'finished-on-remote' to 'started'"
        );
    }
}
