use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::store::{Alert, DedupDecision, Store};
use crate::Result;

/// Cooldown-window deduplication over alert keys.
///
/// The reservation check and the alert insert run as one atomic store
/// operation, so two workers racing on the same key within a cooldown window
/// produce exactly one alert. Two round trips (check, then insert) would
/// race; callers must never re-implement that split here.
pub struct AlertDedup {
    store: Arc<dyn Store>,
}

impl AlertDedup {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Reserve `dedup_key` for `cooldown_seconds` and insert `alert` if no
    /// live reservation exists. Returns `Duplicate` with the remaining
    /// cooldown otherwise.
    pub async fn check(
        &self,
        dedup_key: &str,
        cooldown_seconds: i64,
        alert: Alert,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        self.store
            .reserve_and_insert_alert(dedup_key, cooldown_seconds, alert, now)
            .await
    }
}
