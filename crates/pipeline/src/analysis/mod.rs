pub mod client;

pub use client::{AnalysisClient, HttpAnalysisClient};
#[cfg(test)]
pub use client::MockAnalysisClient;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone)]
pub struct AnalysisConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "****"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Risk assessment for one closed batch, as returned by the analysis service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 0-100.
    pub risk_score: i64,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl RiskAssessment {
    /// Neutral assessment used when analysis is unavailable. Keeps events
    /// flowing so threshold rules still fire on medium risk.
    pub fn fallback() -> Self {
        Self {
            risk_score: 50,
            risk_level: RiskLevel::Medium,
            summary: "Analysis unavailable, defaulted to medium risk".to_string(),
            reasoning: "Fallback assessment applied after analysis failure".to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=100).contains(&self.risk_score) {
            return Err(Error::Client(format!(
                "risk_score {} out of range 0-100",
                self.risk_score
            )));
        }
        Ok(())
    }
}
