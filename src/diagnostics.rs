//! Failure diagnostics
//!
//! When a remote job finishes with an error, its `stderr` and `returncode`
//! are fetched from the job manager with `search` queries and persisted on
//! the record.
//!
//! The `d_ret` container has no fixed shape. A field is located by keyed
//! lookup first (depth-first, document order). If no key matches, the
//! older heuristic applies: the last scalar reached while descending every
//! nested mapping in order.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::event_log::{EventKind, EventLog};
use crate::record::ExecutionRecord;
use crate::remote::JobManager;

pub const STDERR_FIELD: &str = "stderr";
pub const RETURNCODE_FIELD: &str = "returncode";

/// One extracted `key : value` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLine {
    pub key: String,
    pub value: String,
}

impl DiagnosticLine {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for DiagnosticLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.key, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default)]
    pub stderr: Option<DiagnosticLine>,
    #[serde(default)]
    pub returncode: Option<DiagnosticLine>,
    pub collected: DateTime<Utc>,
}

impl Diagnostic {
    /// Diagnostic for a failed local run; no return code when the child never exited normally
    pub fn local(stderr: &str, code: Option<i32>) -> Self {
        Self {
            stderr: Some(DiagnosticLine::new(STDERR_FIELD, stderr.trim_end())),
            returncode: code.map(|c| DiagnosticLine::new(RETURNCODE_FIELD, c.to_string())),
            collected: Utc::now(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        [&self.stderr, &self.returncode]
            .into_iter()
            .flatten()
            .map(ToString::to_string)
            .collect()
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Depth-first search for `field`, first match in document order
pub fn find_field(container: &Value, field: &str) -> Option<DiagnosticLine> {
    let map = container.as_object()?;
    for (key, value) in map {
        if value.is_object() {
            if let Some(found) = find_field(value, field) {
                return Some(found);
            }
        } else if key == field {
            return Some(DiagnosticLine::new(key, scalar_text(value)));
        }
    }
    None
}

/// Last scalar reached while descending every nested mapping in order
pub fn deepest_scalar(container: &Value) -> Option<DiagnosticLine> {
    let mut last = None;
    if let Some(map) = container.as_object() {
        for (key, value) in map {
            if value.is_object() {
                if let Some(found) = deepest_scalar(value) {
                    last = Some(found);
                }
            } else {
                last = Some(DiagnosticLine::new(key, scalar_text(value)));
            }
        }
    }
    last
}

pub fn extract(container: &Value, field: &str) -> Option<DiagnosticLine> {
    find_field(container, field).or_else(|| deepest_scalar(container))
}

#[derive(Clone)]
pub struct ErrorCollector {
    manager: Arc<dyn JobManager>,
    event_log: EventLog,
}

impl ErrorCollector {
    pub fn new(manager: Arc<dyn JobManager>, event_log: EventLog) -> Self {
        Self { manager, event_log }
    }

    /// Query `stderr` then `returncode`. A field whose query fails is left empty.
    pub async fn collect(&self, record: &ExecutionRecord) -> Diagnostic {
        let stderr = self.field(record, STDERR_FIELD).await;
        let returncode = self.field(record, RETURNCODE_FIELD).await;
        let diagnostic = Diagnostic {
            stderr,
            returncode,
            collected: Utc::now(),
        };

        let lines = diagnostic.lines();
        for line in &lines {
            error!(record_id = record.id, "{}", line);
        }
        self.event_log.emit(EventKind::DiagnosticCollected {
            record_id: record.id,
            lines,
        });
        diagnostic
    }

    async fn field(&self, record: &ExecutionRecord, field: &str) -> Option<DiagnosticLine> {
        match self.manager.query_field(record, field).await {
            Ok(response) => extract(response.d_ret(), field),
            Err(e) => {
                warn!(record_id = record.id, field, error = %e, "Could not fetch diagnostic field");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecutionStatus, Owner};
    use crate::remote::{JobAction, JobMeta, MockJobManager};
    use serde_json::json;

    fn record() -> ExecutionRecord {
        ExecutionRecord {
            id: 12,
            status: ExecutionStatus::FinishedWithError,
            start_time: Utc::now(),
            end_time: None,
            parent: None,
            plugin: "freesurfer".into(),
            owner: Owner::new("alice"),
            mode: None,
            diagnostic: None,
        }
    }

    #[test]
    fn keyed_lookup_finds_field_in_any_branch() {
        let d_ret = json!({
            "0": {"start": {"pid": 99}},
            "1": {"end": {"stderr": "segfault", "returncode": 139}}
        });
        assert_eq!(
            extract(&d_ret, "stderr").unwrap().to_string(),
            "stderr : segfault"
        );
        assert_eq!(
            extract(&d_ret, "returncode").unwrap().to_string(),
            "returncode : 139"
        );
    }

    #[test]
    fn heuristic_returns_last_scalar_in_order() {
        let d_ret = json!({"job": {"0": {"end": {"output": "oops"}}}, "status": true});
        assert_eq!(
            extract(&d_ret, "stderr").unwrap(),
            DiagnosticLine::new("status", "true")
        );
        let nested = json!({"a": {"b": {"c": "deep"}}});
        assert_eq!(deepest_scalar(&nested).unwrap().to_string(), "c : deep");
    }

    #[test]
    fn empty_container_yields_nothing() {
        assert!(extract(&json!({}), "stderr").is_none());
        assert!(extract(&json!("flat"), "stderr").is_none());
    }

    #[test]
    fn local_diagnostic_lines() {
        let d = Diagnostic::local("bad input\n", Some(2));
        assert_eq!(d.lines(), vec!["stderr : bad input", "returncode : 2"]);
    }

    #[tokio::test]
    async fn collect_queries_stderr_then_returncode() {
        let mock = Arc::new(MockJobManager::new());
        mock.queue_json(json!({"d_ret": {"0": {"end": {"stderr": "no such file"}}}}))
            .queue_json(json!({"d_ret": {"0": {"end": {"returncode": 1}}}}));
        let log = EventLog::new();
        let collector = ErrorCollector::new(mock.clone(), log.clone());

        let diagnostic = collector.collect(&record()).await;
        assert_eq!(
            diagnostic.lines(),
            vec!["stderr : no such file", "returncode : 1"]
        );

        let fields: Vec<_> = mock
            .requests_for(JobAction::Search)
            .into_iter()
            .map(|m| match m.meta {
                JobMeta::Search { field, .. } => field,
                other => panic!("unexpected meta {:?}", other),
            })
            .collect();
        assert_eq!(fields, vec!["stderr", "returncode"]);
        assert_eq!(log.filter_record(12).len(), 1);
    }

    #[tokio::test]
    async fn failed_field_query_leaves_field_empty() {
        let mock = Arc::new(MockJobManager::new());
        mock.queue_error("timeout")
            .queue_json(json!({"d_ret": {"returncode": 3}}));
        let collector = ErrorCollector::new(mock, EventLog::new());

        let diagnostic = collector.collect(&record()).await;
        assert!(diagnostic.stderr.is_none());
        assert_eq!(diagnostic.returncode.unwrap().value, "3");
    }
}
