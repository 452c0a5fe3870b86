//! Mock job manager for testing
//!
//! Returns scripted responses (FIFO) and records every message it was sent.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{JobAction, JobManager, JobMessage, JobResponse};
use crate::error::{CharmError, Result};

type Scripted = std::result::Result<Value, String>;

#[derive(Clone)]
pub struct MockJobManager {
    responses: Arc<Mutex<VecDeque<Scripted>>>,
    default_response: Value,
    requests: Arc<Mutex<Vec<JobMessage>>>,
}

impl MockJobManager {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            default_response: json!({ "d_ret": {} }),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Response used once the queue is empty
    pub fn with_default(mut self, body: Value) -> Self {
        self.default_response = body;
        self
    }

    /// Queue a raw JSON body
    pub fn queue_json(&self, body: Value) -> &Self {
        self.responses.lock().push_back(Ok(body));
        self
    }

    /// Queue a `{"d_ret": {"l_status": [status]}}` body
    pub fn queue_status(&self, status: &str) -> &Self {
        self.queue_json(json!({ "d_ret": { "l_status": [status] } }))
    }

    /// Queue a communication failure
    pub fn queue_error(&self, reason: &str) -> &Self {
        self.responses.lock().push_back(Err(reason.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<JobMessage> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, action: JobAction) -> Vec<JobMessage> {
        self.requests
            .lock()
            .iter()
            .filter(|m| m.action == action)
            .cloned()
            .collect()
    }

    pub fn last_request(&self) -> Option<JobMessage> {
        self.requests.lock().last().cloned()
    }
}

impl Default for MockJobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobManager for MockJobManager {
    async fn send(&self, message: &JobMessage) -> Result<JobResponse> {
        self.requests.lock().push(message.clone());
        let next = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_response.clone()));
        match next {
            Ok(body) => JobResponse::from_value(body),
            Err(reason) => Err(CharmError::remote(reason)),
        }
    }
}
