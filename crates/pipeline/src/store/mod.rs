mod config;
mod memory;
mod models;
mod sqlite;
mod factory;

pub use config::{DatabaseConfig, DatabaseType};
pub use memory::MemoryStore;
pub use models::*;
pub use sqlite::SqliteStore;
pub use factory::create_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Shared pipeline state. Every method is a single atomic step: callers never
/// compose a read with a dependent write across two calls, so any number of
/// workers may hit the same backend concurrently.
///
/// Time-dependent operations take `now` explicitly so tests can drive the
/// clock. Batch rows carry a TTL but stay visible until `purge_expired`
/// removes them; the TTL is a leak bound for crashed workers, not part of the
/// close logic.
#[async_trait]
pub trait Store: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    // Batch operations
    async fn append_detection(&self, detection: &Detection, candidate_batch_id: &str, now: DateTime<Utc>, ttl_seconds: i64) -> crate::Result<AppendOutcome>;
    async fn take_batch(&self, source_id: &str) -> crate::Result<Option<ClosedBatch>>;
    async fn tracked_batches(&self) -> crate::Result<Vec<TrackedBatch>>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> crate::Result<u64>;

    // Dead letter operations
    async fn push_dead_letter(&self, queue: &str, entry: &DeadLetterEntry, capacity: usize) -> crate::Result<DeadLetterOutcome>;
    async fn dead_letter_len(&self, queue: &str) -> crate::Result<usize>;
    async fn list_dead_letters(&self, queue: &str, limit: i64) -> crate::Result<Vec<DeadLetterEntry>>;

    // Alert operations
    async fn reserve_and_insert_alert(&self, dedup_key: &str, cooldown_seconds: i64, alert: Alert, now: DateTime<Utc>) -> crate::Result<DedupDecision>;
    async fn get_alert(&self, id: Uuid) -> crate::Result<Option<Alert>>;
    async fn mark_alert_delivered(&self, id: Uuid, delivered_at: DateTime<Utc>) -> crate::Result<()>;
    async fn list_alerts(&self, limit: i64) -> crate::Result<Vec<Alert>>;

    // Rule operations
    async fn upsert_rule(&self, rule: AlertRule) -> crate::Result<()>;
    async fn list_enabled_rules(&self) -> crate::Result<Vec<AlertRule>>;
}

/// Result of the get-or-create append. When no batch was open for the source
/// the candidate id was installed and `created` is true; otherwise the
/// detection joined the incumbent batch named in `batch_id`.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub batch_id: String,
    pub created: bool,
    pub batch_len: usize,
}

/// Batch removed from tracking by `take_batch`. Exactly one caller gets this
/// for a given batch; the loser of a close race gets `None`.
#[derive(Debug, Clone)]
pub struct ClosedBatch {
    pub batch_id: String,
    pub source_id: String,
    pub detections: Vec<Detection>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Open batch as seen by the timeout sweep.
#[derive(Debug, Clone)]
pub struct TrackedBatch {
    pub source_id: String,
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum DeadLetterOutcome {
    /// Entry stored on the named queue, which now holds this many entries.
    Stored(usize),
    /// Named queue was full; entry stored on its overflow queue instead.
    Overflowed(usize),
}

#[derive(Debug)]
pub enum DedupDecision {
    /// No live reservation existed; the alert was inserted.
    Created(Alert),
    /// A reservation is still cooling down; no alert was inserted.
    Duplicate {
        existing_alert: Option<Alert>,
        seconds_until_expiry: i64,
    },
}

/// Overflow queue paired with a capped dead letter queue.
pub fn overflow_queue(queue: &str) -> String {
    format!("{}:overflow", queue)
}
