use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AnalysisJob, BatchConfig, BatchOutcome, CloseReason};
use crate::store::{Detection, Store};
use crate::{metrics, Result};

/// Groups detections into per-source batches on the shared store.
///
/// Ingestion is one store call, so concurrent producers for the same source
/// land in the same batch without any coordination here. High-confidence
/// critical detections bypass batching entirely.
pub struct BatchAggregator {
    store: Arc<dyn Store>,
    config: BatchConfig,
}

impl BatchAggregator {
    pub fn new(store: Arc<dyn Store>, config: BatchConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub async fn add_detection(&self, detection: &Detection) -> Result<BatchOutcome> {
        self.add_detection_at(detection, Utc::now()).await
    }

    pub async fn add_detection_at(
        &self,
        detection: &Detection,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome> {
        metrics::DETECTIONS_INGESTED_TOTAL.inc();

        if self.is_fast_path(detection) {
            metrics::FAST_PATH_TOTAL.inc();
            info!(
                "Fast-path detection {} from {} ({} @ {:.2})",
                detection.detection_id, detection.source_id, detection.object_type,
                detection.confidence
            );
            return Ok(BatchOutcome::FastPath(AnalysisJob::fast_path(detection, now)));
        }

        let candidate = Uuid::new_v4().to_string();
        let outcome = self
            .store
            .append_detection(detection, &candidate, now, self.config.ttl_seconds)
            .await?;

        if outcome.created {
            debug!(
                "Opened batch {} for source {}",
                outcome.batch_id, detection.source_id
            );
        }

        Ok(BatchOutcome::Batched {
            batch_id: outcome.batch_id,
            batch_len: outcome.batch_len,
        })
    }

    /// Close the source's batch now, regardless of timers.
    pub async fn force_close(&self, source_id: &str) -> Result<Option<AnalysisJob>> {
        self.close_batch(source_id, CloseReason::ForceClosed, Utc::now())
            .await
    }

    /// Take the batch off tracking and turn it into an analysis job. Returns
    /// `None` when another closer got there first.
    pub(crate) async fn close_batch(
        &self,
        source_id: &str,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisJob>> {
        let Some(closed) = self.store.take_batch(source_id).await? else {
            return Ok(None);
        };

        metrics::BATCHES_CLOSED_TOTAL
            .with_label_values(&[&reason.to_string()])
            .inc();
        info!(
            "Closed batch {} for source {} ({} detections, {})",
            closed.batch_id,
            source_id,
            closed.detections.len(),
            reason
        );

        Ok(Some(AnalysisJob::from_closed(closed, reason, now)))
    }

    fn is_fast_path(&self, detection: &Detection) -> bool {
        detection.confidence >= self.config.fast_path_threshold
            && self
                .config
                .fast_path_types
                .iter()
                .any(|t| t == &detection.object_type)
    }
}
