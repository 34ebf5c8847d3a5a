use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{Error, Result};

// Raw detection event as handed in by a producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub source_id: String,
    pub detection_id: String,
    pub object_type: String,
    pub confidence: f64,
}

impl Detection {
    pub fn new(source_id: &str, detection_id: &str, object_type: &str, confidence: f64) -> Self {
        Self {
            source_id: source_id.to_string(),
            detection_id: detection_id.to_string(),
            object_type: object_type.to_string(),
            confidence,
        }
    }
}

// Alert lifecycle tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub event_id: Uuid,
    pub rule_id: String,
    pub source_id: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub dedup_key: String,
    pub risk_score: i64,
    pub summary: Option<String>,
    pub channels: Vec<String>,

    // Timing
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Delivered,
    Acknowledged,
    Dismissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

// Alert rule definition. All match fields are optional; an unset field
// places no constraint on the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub severity: AlertSeverity,

    // Match conditions
    pub risk_threshold: Option<i64>,
    pub object_types: Option<Vec<String>>,
    pub source_ids: Option<Vec<String>>,
    pub min_confidence: Option<f64>,
    /// Active-hours window, kept as raw JSON and parsed at evaluation time
    /// so a malformed schedule fails one rule instead of the whole table.
    pub schedule: Option<JsonValue>,

    // Alert shaping
    pub dedup_key_template: String,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown_seconds() -> i64 {
    300
}

// Job that exhausted its retries, parked for manual inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_job: JsonValue,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

// Helper implementations for parsing string to enums
impl std::str::FromStr for AlertStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "delivered" => Ok(AlertStatus::Delivered),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "dismissed" => Ok(AlertStatus::Dismissed),
            _ => Err(Error::Config(format!("Invalid alert status: {}", s))),
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Pending => write!(f, "pending"),
            AlertStatus::Delivered => write!(f, "delivered"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Dismissed => write!(f, "dismissed"),
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(AlertSeverity::Critical),
            "warning" => Ok(AlertSeverity::Warning),
            "info" => Ok(AlertSeverity::Info),
            _ => Err(Error::Config(format!("Invalid alert severity: {}", s))),
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Critical => write!(f, "critical"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Info => write!(f, "info"),
        }
    }
}
