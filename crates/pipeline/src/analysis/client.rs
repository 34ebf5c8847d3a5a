use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{AnalysisConfig, RiskAssessment};
use crate::{Error, Result};

/// Client for the external risk analysis service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(&self, source_id: &str, detection_ids: &[String]) -> Result<RiskAssessment>;
}

pub struct HttpAnalysisClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    source_id: &'a str,
    detection_ids: &'a [String],
}

impl HttpAnalysisClient {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn analyze(&self, source_id: &str, detection_ids: &[String]) -> Result<RiskAssessment> {
        debug!(
            "Requesting analysis for source {} ({} detections)",
            source_id,
            detection_ids.len()
        );

        let mut request = self.client.post(&self.endpoint).json(&AnalyzeRequest {
            source_id,
            detection_ids,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transient(format!("Analysis request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Transient("Analysis service throttled request".to_string()));
        }
        if status.is_client_error() {
            return Err(Error::Client(format!(
                "Analysis service rejected request: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(Error::Transient(format!(
                "Analysis service returned {}",
                status
            )));
        }

        let assessment: RiskAssessment = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("Invalid analysis response: {}", e)))?;
        assessment.validate()?;

        Ok(assessment)
    }
}
