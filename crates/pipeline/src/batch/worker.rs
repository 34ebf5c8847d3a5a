use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::{AnalysisJob, BatchAggregator, BatchConfig, CloseReason};
use crate::store::Store;
use crate::Result;

/// Periodic sweep that closes batches past their window or idle deadline and
/// purges rows whose TTL lapsed.
///
/// Closing goes through the same take-and-delete as every other closer, so a
/// sweep racing a force close (or another sweep) never double-processes a
/// batch. A full analysis queue blocks the sweep rather than dropping jobs.
pub struct BatchTimeoutWorker {
    store: Arc<dyn Store>,
    aggregator: Arc<BatchAggregator>,
    queue_tx: mpsc::Sender<AnalysisJob>,
    config: BatchConfig,
    shutdown: watch::Receiver<bool>,
}

impl BatchTimeoutWorker {
    pub fn new(
        store: Arc<dyn Store>,
        aggregator: Arc<BatchAggregator>,
        queue_tx: mpsc::Sender<AnalysisJob>,
        config: BatchConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            aggregator,
            queue_tx,
            config,
            shutdown,
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Batch timeout worker started (sweep every {:?})",
                self.config.sweep_interval
            );
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep(Utc::now()).await {
                            error!("Batch sweep failed: {}", e);
                        }
                    }
                    _ = self.shutdown.changed() => {
                        info!("Batch timeout worker stopping");
                        break;
                    }
                }
            }
        })
    }

    /// One pass over every tracked batch. Returns how many were closed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut closed = 0;

        for tracked in self.store.tracked_batches().await? {
            let age = now.signed_duration_since(tracked.started_at).num_seconds();
            let idle = now
                .signed_duration_since(tracked.last_activity_at)
                .num_seconds();

            let reason = if age >= self.config.window_seconds {
                CloseReason::WindowTimeout
            } else if idle >= self.config.idle_seconds {
                CloseReason::IdleTimeout
            } else {
                continue;
            };

            // One failed source must not stall the rest of the sweep
            match self
                .aggregator
                .close_batch(&tracked.source_id, reason, now)
                .await
            {
                Ok(Some(job)) => {
                    closed += 1;
                    if self.queue_tx.send(job).await.is_err() {
                        warn!("Analysis queue closed, dropping batch job");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Failed to close batch for source {}: {}",
                        tracked.source_id, e
                    );
                }
            }
        }

        self.store.purge_expired(now).await?;
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Detection, MemoryStore};

    fn worker_with_queue(
        config: BatchConfig,
    ) -> (
        BatchTimeoutWorker,
        Arc<BatchAggregator>,
        mpsc::Receiver<AnalysisJob>,
    ) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let aggregator = Arc::new(BatchAggregator::new(Arc::clone(&store), config.clone()));
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Tests drive sweep() directly, so the run loop never observes this
        drop(shutdown_tx);
        let worker = BatchTimeoutWorker::new(store, Arc::clone(&aggregator), tx, config, shutdown_rx);
        (worker, aggregator, rx)
    }

    fn test_config() -> BatchConfig {
        BatchConfig {
            window_seconds: 60,
            idle_seconds: 30,
            ttl_seconds: 3600,
            ..BatchConfig::default()
        }
    }

    #[tokio::test]
    async fn window_deadline_closes_batch() {
        let (worker, aggregator, mut rx) = worker_with_queue(test_config());
        let t0 = Utc::now();

        aggregator
            .add_detection_at(&Detection::new("cam-1", "d1", "person", 0.5), t0)
            .await
            .unwrap();

        // Still inside the window
        assert_eq!(worker.sweep(t0 + chrono::Duration::seconds(10)).await.unwrap(), 0);

        let closed = worker.sweep(t0 + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(closed, 1);

        let job = rx.recv().await.unwrap();
        assert_eq!(job.close_reason, CloseReason::WindowTimeout);
        assert_eq!(job.source_id, "cam-1");
    }

    #[tokio::test]
    async fn idle_deadline_closes_before_window() {
        let (worker, aggregator, mut rx) = worker_with_queue(test_config());
        let t0 = Utc::now();

        aggregator
            .add_detection_at(&Detection::new("cam-1", "d1", "person", 0.5), t0)
            .await
            .unwrap();
        aggregator
            .add_detection_at(&Detection::new("cam-1", "d2", "person", 0.5), t0 + chrono::Duration::seconds(5))
            .await
            .unwrap();

        // 36s after start: age below the 60s window, idle 31s over the 30s limit
        let closed = worker.sweep(t0 + chrono::Duration::seconds(36)).await.unwrap();
        assert_eq!(closed, 1);

        let job = rx.recv().await.unwrap();
        assert_eq!(job.close_reason, CloseReason::IdleTimeout);
        assert_eq!(job.detections.len(), 2);
    }

    #[tokio::test]
    async fn steady_activity_still_hits_window_cap() {
        let (worker, aggregator, mut rx) = worker_with_queue(test_config());
        let t0 = Utc::now();

        for i in 0..6 {
            aggregator
                .add_detection_at(
                    &Detection::new("cam-1", &format!("d{}", i), "person", 0.5),
                    t0 + chrono::Duration::seconds(i * 10),
                )
                .await
                .unwrap();
        }

        // Last activity at t0+50, so idle is only 11s; the window still wins
        let closed = worker.sweep(t0 + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(rx.recv().await.unwrap().close_reason, CloseReason::WindowTimeout);
    }

    #[tokio::test]
    async fn sweep_purges_expired_rows_without_closing() {
        let config = BatchConfig {
            window_seconds: 1000,
            idle_seconds: 1000,
            ttl_seconds: 0,
            ..BatchConfig::default()
        };
        let (worker, aggregator, _rx) = worker_with_queue(config);
        let t0 = Utc::now();

        aggregator
            .add_detection_at(&Detection::new("cam-1", "d1", "person", 0.5), t0)
            .await
            .unwrap();

        let closed = worker.sweep(t0 + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(closed, 0);
        assert!(worker.store.tracked_batches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_handles_multiple_sources() {
        let (worker, aggregator, mut rx) = worker_with_queue(test_config());
        let t0 = Utc::now();

        aggregator
            .add_detection_at(&Detection::new("cam-1", "d1", "person", 0.5), t0)
            .await
            .unwrap();
        aggregator
            .add_detection_at(&Detection::new("cam-2", "d2", "person", 0.5), t0 + chrono::Duration::seconds(40))
            .await
            .unwrap();

        // cam-1 idles out at t0+40+; cam-2 is still fresh
        let closed = worker.sweep(t0 + chrono::Duration::seconds(45)).await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(rx.recv().await.unwrap().source_id, "cam-1");
    }
}
