mod aggregator;
mod worker;

pub use aggregator::BatchAggregator;
pub use worker::BatchTimeoutWorker;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{ClosedBatch, Detection};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Hard cap on batch age, regardless of activity.
    pub window_seconds: i64,
    /// Inactivity gap that closes a batch early.
    pub idle_seconds: i64,
    /// Leak bound on batch rows left behind by crashed workers.
    pub ttl_seconds: i64,
    /// Cadence of the timeout sweep.
    pub sweep_interval: Duration,
    /// Confidence at or above which critical detections skip batching.
    pub fast_path_threshold: f64,
    /// Object types eligible for the fast path.
    pub fast_path_types: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            idle_seconds: 30,
            ttl_seconds: 3600,
            sweep_interval: Duration::from_secs(10),
            fast_path_threshold: 0.9,
            fast_path_types: vec![
                "person".to_string(),
                "fire".to_string(),
                "weapon".to_string(),
            ],
        }
    }
}

/// Why a batch stopped accepting detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    WindowTimeout,
    IdleTimeout,
    ForceClosed,
    FastPath,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::WindowTimeout => write!(f, "window_timeout"),
            CloseReason::IdleTimeout => write!(f, "idle_timeout"),
            CloseReason::ForceClosed => write!(f, "force_closed"),
            CloseReason::FastPath => write!(f, "fast_path"),
        }
    }
}

/// Unit of work handed to the analysis stage: one closed batch, or a single
/// fast-path detection wrapped in a batch of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub batch_id: String,
    pub source_id: String,
    pub detections: Vec<Detection>,
    pub close_reason: CloseReason,
    pub is_fast_path: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn from_closed(batch: ClosedBatch, reason: CloseReason, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch.batch_id,
            source_id: batch.source_id,
            detections: batch.detections,
            close_reason: reason,
            is_fast_path: false,
            enqueued_at: now,
        }
    }

    /// Fast-path detections never touch batch tracking; they get a fresh
    /// single-detection batch id of their own.
    pub fn fast_path(detection: &Detection, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            source_id: detection.source_id.clone(),
            detections: vec![detection.clone()],
            close_reason: CloseReason::FastPath,
            is_fast_path: true,
            enqueued_at: now,
        }
    }

    pub fn detection_ids(&self) -> Vec<String> {
        self.detections
            .iter()
            .map(|d| d.detection_id.clone())
            .collect()
    }
}

/// What happened to an ingested detection.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Joined (or opened) the source's current batch.
    Batched { batch_id: String, batch_len: usize },
    /// Bypassed batching; the job should go straight to analysis.
    FastPath(AnalysisJob),
}
