use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::config::ReasoningConfig;
use crate::evidence::EvidenceRecord;

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reasoning service answered with status {0}")]
    Status(u16),
}

/// Posts evidence to the external reasoning service and returns its JSON
/// reply untouched.
#[derive(Debug, Clone)]
pub struct ReasoningClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl ReasoningClient {
    pub fn from_config(cfg: &ReasoningConfig) -> Result<Option<Self>, ReasoningError> {
        let Some(endpoint) = cfg.endpoint.clone() else {
            return Ok(None);
        };
        let client = Client::builder()
            .user_agent(concat!("netsleuth/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Some(Self {
            client,
            endpoint,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn request_hypotheses(&self, evidence: &EvidenceRecord) -> Result<Value, ReasoningError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(evidence)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ReasoningError::Status(status.as_u16()));
        }
        Ok(resp.json::<Value>().await?)
    }
}
