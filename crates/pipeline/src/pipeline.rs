use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertEngine, IncidentEvent};
use crate::analysis::{AnalysisClient, RiskAssessment};
use crate::batch::{
    AnalysisJob, BatchAggregator, BatchConfig, BatchOutcome, BatchTimeoutWorker,
};
use crate::dispatch::NotificationDispatcher;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, DeadLetterQueue, RetryConfig, RetryHandler,
};
use crate::store::{Detection, Store};
use crate::{metrics, Error, Result};

pub const ANALYSIS_QUEUE: &str = "analysis";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dlq_capacity: usize,
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dlq_capacity: 1000,
            queue_capacity: 100,
        }
    }
}

/// Wires the full path from raw detection to delivered alert: aggregation,
/// timeout sweeping, the resilient analysis call and rule evaluation.
///
/// One analysis worker drains the queue; the timeout worker feeds it
/// alongside fast-path ingests and force closes. All of them share the
/// store, which carries the batch, alert and dead-letter state.
pub struct Pipeline {
    store: Arc<dyn Store>,
    aggregator: Arc<BatchAggregator>,
    engine: AlertEngine,
    client: Arc<dyn AnalysisClient>,
    breakers: CircuitBreakerRegistry,
    retry: RetryHandler,
    queue_tx: mpsc::Sender<AnalysisJob>,
    queue_rx: Arc<RwLock<mpsc::Receiver<AnalysisJob>>>,
    batch_config: BatchConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn AnalysisClient>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: PipelineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let aggregator = Arc::new(BatchAggregator::new(
            Arc::clone(&store),
            config.batch.clone(),
        ));
        let engine = AlertEngine::new(Arc::clone(&store), dispatcher);
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker);
        let dlq = DeadLetterQueue::new(Arc::clone(&store), config.dlq_capacity);
        let retry = RetryHandler::new(config.retry, dlq);

        Self {
            store,
            aggregator,
            engine,
            client,
            breakers,
            retry,
            queue_tx,
            queue_rx: Arc::new(RwLock::new(queue_rx)),
            batch_config: config.batch,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn the analysis worker and the batch timeout sweeper.
    pub fn start(self: Arc<Self>) {
        info!("Starting detection pipeline");

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.analysis_loop().await;
        });

        let worker = BatchTimeoutWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.aggregator),
            self.queue_tx.clone(),
            self.batch_config.clone(),
            self.shutdown_rx.clone(),
        );
        worker.spawn();
    }

    pub fn shutdown(&self) {
        info!("Stopping detection pipeline");
        let _ = self.shutdown_tx.send(true);
    }

    /// Hand one detection to the aggregator. Fast-path detections are
    /// enqueued for standalone analysis before this returns.
    pub async fn ingest(&self, detection: &Detection) -> Result<BatchOutcome> {
        let outcome = self.aggregator.add_detection(detection).await?;
        if let BatchOutcome::FastPath(job) = &outcome {
            self.enqueue(job.clone()).await?;
        }
        Ok(outcome)
    }

    /// Close the source's open batch immediately. Returns false when there
    /// was nothing to close (or a concurrent closer won).
    pub async fn force_close(&self, source_id: &str) -> Result<bool> {
        match self.aggregator.force_close(source_id).await? {
            Some(job) => {
                self.enqueue(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn circuit_state(&self) -> crate::resilience::CircuitState {
        self.breakers.get_or_create(ANALYSIS_QUEUE).state()
    }

    async fn enqueue(&self, job: AnalysisJob) -> Result<()> {
        self.queue_tx
            .send(job)
            .await
            .map_err(|e| Error::Internal(format!("Failed to enqueue analysis job: {}", e)))
    }

    async fn analysis_loop(self: Arc<Self>) {
        let mut rx = self.queue_rx.write().await;
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => {
                        if let Err(e) = self.process_job(job).await {
                            error!("Analysis job failed: {}", e);
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    info!("Analysis worker stopping");
                    break;
                }
            }
        }
    }

    /// Score one job through the guarded analysis call and evaluate the
    /// result against the alert rules. Total analysis failure degrades to
    /// the fallback assessment instead of dropping the job.
    async fn process_job(&self, job: AnalysisJob) -> Result<()> {
        let detection_ids = job.detection_ids();
        let job_json = serde_json::to_value(&job)?;

        let breaker = self.breakers.get_or_create(ANALYSIS_QUEUE);
        let outcome = self
            .retry
            .run(ANALYSIS_QUEUE, job_json, || {
                let breaker = Arc::clone(&breaker);
                let client = Arc::clone(&self.client);
                let source_id = job.source_id.clone();
                let detection_ids = detection_ids.clone();
                async move {
                    breaker
                        .call(|| async move { client.analyze(&source_id, &detection_ids).await })
                        .await
                }
            })
            .await;

        let risk = match outcome.value {
            Some(assessment) => assessment,
            None => {
                metrics::ANALYSIS_FAILURES_TOTAL.inc();
                metrics::ANALYSIS_FALLBACKS_TOTAL.inc();
                warn!(
                    "Analysis failed for batch {} after {} attempt(s) ({}); using fallback",
                    job.batch_id,
                    outcome.attempts,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                RiskAssessment::fallback()
            }
        };

        let event = IncidentEvent {
            event_id: Uuid::new_v4(),
            batch_id: job.batch_id.clone(),
            source_id: job.source_id.clone(),
            detections: job.detections.clone(),
            risk,
            is_fast_path: job.is_fast_path,
            occurred_at: Utc::now(),
        };

        let alerts = self.engine.evaluate_event(&event).await?;
        info!(
            "Processed batch {} from {}: {} alert(s)",
            event.batch_id,
            event.source_id,
            alerts.len()
        );
        Ok(())
    }
}
