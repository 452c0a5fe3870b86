//! # Remote Job Manager Protocol
//!
//! One JSON message per call, `{action, meta}`, POSTed to the job manager:
//!
//! | action | meta |
//! |--------|------|
//! | `run` | `cmd`, `threaded`, `auid`, `jid` |
//! | `status` | `key: "jid"`, `value: <jid>` |
//! | `search` | `key: "jid"`, `value: <jid>`, `job: "0"`, `when: "end"`, `field` |
//!
//! Responses carry a job-manager-defined result container under `d_ret`.
//!
//! - [`JobManager`] - transport trait; `submit`/`query_status`/`query_field` build on `send`
//! - [`PmanClient`] - HTTP implementation with timeout and bounded retries
//! - [`MockJobManager`] - scripted responses for tests

mod http;
mod mock;
mod retry;

pub use http::{PmanClient, CONTENT_TYPE};
pub use mock::MockJobManager;
pub use retry::{RetryConfig, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandLine;
use crate::error::{CharmError, Result};
use crate::record::ExecutionRecord;

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Run,
    Status,
    Search,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobMeta {
    Run {
        cmd: String,
        threaded: bool,
        auid: String,
        jid: String,
    },
    Search {
        key: String,
        value: String,
        job: String,
        when: String,
        field: String,
    },
    Status {
        key: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub action: JobAction,
    pub meta: JobMeta,
}

impl JobMessage {
    pub fn run(record: &ExecutionRecord, command: &CommandLine) -> Self {
        Self {
            action: JobAction::Run,
            meta: JobMeta::Run {
                cmd: command.to_shell_string(),
                threaded: true,
                auid: record.owner.username.clone(),
                jid: record.id.to_string(),
            },
        }
    }

    pub fn status(record: &ExecutionRecord) -> Self {
        Self {
            action: JobAction::Status,
            meta: JobMeta::Status {
                key: "jid".to_string(),
                value: record.id.to_string(),
            },
        }
    }

    pub fn search(record: &ExecutionRecord, field: &str) -> Self {
        Self {
            action: JobAction::Search,
            meta: JobMeta::Search {
                key: "jid".to_string(),
                value: record.id.to_string(),
                job: "0".to_string(),
                when: "end".to_string(),
                field: field.to_string(),
            },
        }
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

/// Parsed job manager response
#[derive(Debug, Clone, PartialEq)]
pub struct JobResponse {
    body: Value,
}

impl JobResponse {
    /// Parse a raw response body; it must be a JSON object holding `d_ret`
    pub fn parse(raw: &str) -> Result<Self> {
        let body: Value = serde_json::from_str(raw)
            .map_err(|e| CharmError::remote(format!("malformed JSON response: {}", e)))?;
        Self::from_value(body)
    }

    pub fn from_value(body: Value) -> Result<Self> {
        if body.get("d_ret").is_none() {
            return Err(CharmError::remote("response has no 'd_ret' container"));
        }
        Ok(Self { body })
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn d_ret(&self) -> &Value {
        &self.body["d_ret"]
    }

    /// Remote job status, `d_ret.l_status[0]`
    pub fn status(&self) -> Result<&str> {
        self.d_ret()
            .get("l_status")
            .and_then(|s| s.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| CharmError::remote("status response has no 'd_ret.l_status[0]' string"))
    }
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

#[async_trait]
pub trait JobManager: Send + Sync {
    /// Send one message and parse the reply
    async fn send(&self, message: &JobMessage) -> Result<JobResponse>;

    /// `run`: hand the command line to the job manager for asynchronous execution
    async fn submit(&self, record: &ExecutionRecord, command: &CommandLine) -> Result<JobResponse> {
        self.send(&JobMessage::run(record, command)).await
    }

    async fn query_status(&self, record: &ExecutionRecord) -> Result<JobResponse> {
        self.send(&JobMessage::status(record)).await
    }

    /// `search` for a named end-of-job field such as `stderr` or `returncode`
    async fn query_field(&self, record: &ExecutionRecord, field: &str) -> Result<JobResponse> {
        self.send(&JobMessage::search(record, field)).await
    }
}
