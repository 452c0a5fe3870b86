//! HTTP transport to the job manager
//!
//! POSTs each message with the collection+json content type, optionally
//! wrapped under a key (`{"payload": {action, meta}}`), with a per-request
//! timeout. `status` and `search` are read-only and retried with backoff;
//! `run` is sent exactly once, since a timed-out or failed submission may
//! already have been accepted.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::{JobAction, JobManager, JobMessage, JobResponse, RetryConfig, RetryPolicy};
use crate::config::RemoteConfig;
use crate::error::{CharmError, Result};

pub const CONTENT_TYPE: &str = "application/vnd.collection+json";

pub struct PmanClient {
    client: reqwest::Client,
    endpoint: url::Url,
    json_wrapper: String,
    retry: RetryPolicy,
}

impl PmanClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("charm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CharmError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint()?,
            json_wrapper: config.json_wrapper.clone(),
            retry: RetryPolicy::new(RetryConfig::from(&config.retry)),
        })
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    fn envelope(&self, message: &JobMessage) -> Result<Value> {
        let body = serde_json::to_value(message)?;
        if self.json_wrapper.is_empty() {
            return Ok(body);
        }
        let mut wrapped = Map::new();
        wrapped.insert(self.json_wrapper.clone(), body);
        Ok(Value::Object(wrapped))
    }

    async fn send_once(&self, body: &str) -> Result<JobResponse> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| CharmError::remote(format!("request to {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CharmError::remote(format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(CharmError::remote(format!(
                "job manager returned {}: {}",
                status, text
            )));
        }
        JobResponse::parse(&text)
    }
}

#[async_trait]
impl JobManager for PmanClient {
    #[instrument(skip(self, message), fields(action = ?message.action, endpoint = %self.endpoint))]
    async fn send(&self, message: &JobMessage) -> Result<JobResponse> {
        let body = serde_json::to_string(&self.envelope(message)?)?;
        debug!(body = %body, "Sending to job manager");
        let response = match message.action {
            JobAction::Run => self.send_once(&body).await?,
            JobAction::Status | JobAction::Search => {
                self.retry.execute(|| self.send_once(&body)).await?
            }
        };
        debug!(response = %response.body(), "Job manager replied");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecutionRecord, ExecutionStatus, Owner};
    use chrono::Utc;

    fn record() -> ExecutionRecord {
        ExecutionRecord {
            id: 3,
            status: ExecutionStatus::Started,
            start_time: Utc::now(),
            end_time: None,
            parent: None,
            plugin: "dcm2nii".into(),
            owner: Owner::new("alice"),
            mode: None,
            diagnostic: None,
        }
    }

    #[test]
    fn envelope_wraps_under_key() {
        let client = PmanClient::new(&RemoteConfig::default()).unwrap();
        let body = client.envelope(&JobMessage::status(&record())).unwrap();
        assert_eq!(body["payload"]["action"], "status");
        assert_eq!(body["payload"]["meta"]["value"], "3");
    }

    #[test]
    fn empty_wrapper_sends_bare_message() {
        let config = RemoteConfig {
            json_wrapper: String::new(),
            ..RemoteConfig::default()
        };
        let client = PmanClient::new(&config).unwrap();
        let body = client.envelope(&JobMessage::status(&record())).unwrap();
        assert_eq!(body["action"], "status");
    }
}
