use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{
    Alert, AlertRule, AlertStatus, AppendOutcome, ClosedBatch, DeadLetterEntry, DeadLetterOutcome,
    DedupDecision, Detection, Store, TrackedBatch, overflow_queue,
};
use crate::Result;

/// In-memory store for tests and single-process deployments. One mutex
/// guards all state, so every trait method is trivially atomic.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    batches: HashMap<String, OpenBatch>,
    dead_letters: HashMap<String, Vec<DeadLetterEntry>>,
    reservations: HashMap<String, Reservation>,
    alerts: HashMap<Uuid, Alert>,
    rules: HashMap<String, AlertRule>,
}

struct OpenBatch {
    batch_id: String,
    detections: Vec<Detection>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

struct Reservation {
    alert_id: Uuid,
    expires_at: DateTime<Utc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn append_detection(
        &self,
        detection: &Detection,
        candidate_batch_id: &str,
        now: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Result<AppendOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let expires_at = now + Duration::seconds(ttl_seconds);

        let mut created = false;
        let batch = inner
            .batches
            .entry(detection.source_id.clone())
            .or_insert_with(|| {
                created = true;
                OpenBatch {
                    batch_id: candidate_batch_id.to_string(),
                    detections: Vec::new(),
                    started_at: now,
                    last_activity_at: now,
                    expires_at,
                }
            });

        batch.detections.push(detection.clone());
        batch.last_activity_at = now;
        batch.expires_at = expires_at;

        Ok(AppendOutcome {
            batch_id: batch.batch_id.clone(),
            created,
            batch_len: batch.detections.len(),
        })
    }

    async fn take_batch(&self, source_id: &str) -> Result<Option<ClosedBatch>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.batches.remove(source_id).map(|batch| ClosedBatch {
            batch_id: batch.batch_id,
            source_id: source_id.to_string(),
            detections: batch.detections,
            started_at: batch.started_at,
            last_activity_at: batch.last_activity_at,
        }))
    }

    async fn tracked_batches(&self) -> Result<Vec<TrackedBatch>> {
        let inner = self.inner.lock().unwrap();
        let mut tracked: Vec<TrackedBatch> = inner
            .batches
            .iter()
            .map(|(source_id, batch)| TrackedBatch {
                source_id: source_id.clone(),
                batch_id: batch.batch_id.clone(),
                started_at: batch.started_at,
                last_activity_at: batch.last_activity_at,
            })
            .collect();
        tracked.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(tracked)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.batches.len();
        inner.batches.retain(|_, batch| batch.expires_at > now);
        let purged = (before - inner.batches.len()) as u64;
        if purged > 0 {
            debug!("Purged {} expired batches", purged);
        }
        Ok(purged)
    }

    async fn push_dead_letter(
        &self,
        queue: &str,
        entry: &DeadLetterEntry,
        capacity: usize,
    ) -> Result<DeadLetterOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.dead_letters.get(queue).map_or(0, Vec::len);
        if len < capacity {
            let entries = inner.dead_letters.entry(queue.to_string()).or_default();
            entries.push(entry.clone());
            Ok(DeadLetterOutcome::Stored(entries.len()))
        } else {
            let entries = inner
                .dead_letters
                .entry(overflow_queue(queue))
                .or_default();
            entries.push(entry.clone());
            Ok(DeadLetterOutcome::Overflowed(entries.len()))
        }
    }

    async fn dead_letter_len(&self, queue: &str) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.dead_letters.get(queue).map_or(0, Vec::len))
    }

    async fn list_dead_letters(&self, queue: &str, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let inner = self.inner.lock().unwrap();
        let entries = match inner.dead_letters.get(queue) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        Ok(entries
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn reserve_and_insert_alert(
        &self,
        dedup_key: &str,
        cooldown_seconds: i64,
        alert: Alert,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        let mut inner = self.inner.lock().unwrap();

        // A reservation blocks through its exact expiry instant.
        if let Some(reservation) = inner.reservations.get(dedup_key) {
            if reservation.expires_at >= now {
                let existing_alert = inner.alerts.get(&reservation.alert_id).cloned();
                let seconds_until_expiry = (reservation.expires_at - now).num_seconds().max(0);
                return Ok(DedupDecision::Duplicate {
                    existing_alert,
                    seconds_until_expiry,
                });
            }
        }

        inner.reservations.insert(
            dedup_key.to_string(),
            Reservation {
                alert_id: alert.id,
                expires_at: now + Duration::seconds(cooldown_seconds),
            },
        );
        inner.alerts.insert(alert.id, alert.clone());
        Ok(DedupDecision::Created(alert))
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.alerts.get(&id).cloned())
    }

    async fn mark_alert_delivered(&self, id: Uuid, delivered_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(alert) = inner.alerts.get_mut(&id) {
            alert.status = AlertStatus::Delivered;
            alert.delivered_at = Some(delivered_at);
        }
        Ok(())
    }

    async fn list_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let inner = self.inner.lock().unwrap();
        let mut alerts: Vec<Alert> = inner.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts.truncate(limit.max(0) as usize);
        Ok(alerts)
    }

    async fn upsert_rule(&self, rule: AlertRule) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn list_enabled_rules(&self) -> Result<Vec<AlertRule>> {
        let inner = self.inner.lock().unwrap();
        let mut rules: Vec<AlertRule> = inner
            .rules
            .values()
            .filter(|rule| rule.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AlertSeverity;

    fn sample_detection(source_id: &str, detection_id: &str) -> Detection {
        Detection::new(source_id, detection_id, "person", 0.5)
    }

    fn sample_alert(dedup_key: &str) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            rule_id: "rule-1".to_string(),
            source_id: "cam-1".to_string(),
            severity: AlertSeverity::Warning,
            status: AlertStatus::Pending,
            dedup_key: dedup_key.to_string(),
            risk_score: 70,
            summary: None,
            channels: vec![],
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    #[tokio::test]
    async fn append_creates_then_joins() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = store
            .append_detection(&sample_detection("cam-1", "d1"), "batch-a", now, 60)
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.batch_id, "batch-a");
        assert_eq!(first.batch_len, 1);

        let second = store
            .append_detection(&sample_detection("cam-1", "d2"), "batch-b", now, 60)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.batch_id, "batch-a");
        assert_eq!(second.batch_len, 2);
    }

    #[tokio::test]
    async fn sources_get_independent_batches() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .append_detection(&sample_detection("cam-1", "d1"), "batch-a", now, 60)
            .await
            .unwrap();
        store
            .append_detection(&sample_detection("cam-2", "d2"), "batch-b", now, 60)
            .await
            .unwrap();

        let tracked = store.tracked_batches().await.unwrap();
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].source_id, "cam-1");
        assert_eq!(tracked[1].source_id, "cam-2");
    }

    #[tokio::test]
    async fn take_batch_is_exactly_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append_detection(&sample_detection("cam-1", "d1"), "batch-a", now, 60)
            .await
            .unwrap();

        let closed = store.take_batch("cam-1").await.unwrap();
        assert!(closed.is_some());
        let closed = closed.unwrap();
        assert_eq!(closed.batch_id, "batch-a");
        assert_eq!(closed.detections.len(), 1);

        // Second take loses the race
        assert!(store.take_batch("cam-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_after_take_starts_fresh_batch() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append_detection(&sample_detection("cam-1", "d1"), "batch-a", now, 60)
            .await
            .unwrap();
        store.take_batch("cam-1").await.unwrap();

        let outcome = store
            .append_detection(&sample_detection("cam-1", "d2"), "batch-b", now, 60)
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.batch_id, "batch-b");
        assert_eq!(outcome.batch_len, 1);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append_detection(&sample_detection("cam-1", "d1"), "batch-a", now, 0)
            .await
            .unwrap();
        store
            .append_detection(&sample_detection("cam-2", "d2"), "batch-b", now, 3600)
            .await
            .unwrap();

        let purged = store
            .purge_expired(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let tracked = store.tracked_batches().await.unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].source_id, "cam-2");
    }

    #[tokio::test]
    async fn dead_letters_overflow_past_capacity() {
        let store = MemoryStore::new();
        let entry = DeadLetterEntry {
            original_job: serde_json::json!({"job": 1}),
            error: "boom".to_string(),
            attempts: 4,
            failed_at: Utc::now(),
        };

        let first = store.push_dead_letter("analysis", &entry, 1).await.unwrap();
        assert!(matches!(first, DeadLetterOutcome::Stored(1)));

        let second = store.push_dead_letter("analysis", &entry, 1).await.unwrap();
        assert!(matches!(second, DeadLetterOutcome::Overflowed(1)));

        assert_eq!(store.dead_letter_len("analysis").await.unwrap(), 1);
        assert_eq!(
            store.dead_letter_len("analysis:overflow").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn dedup_reservation_blocks_then_expires() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = store
            .reserve_and_insert_alert("cam-1:rule-1", 300, sample_alert("cam-1:rule-1"), now)
            .await
            .unwrap();
        assert!(matches!(first, DedupDecision::Created(_)));

        let duplicate = store
            .reserve_and_insert_alert("cam-1:rule-1", 300, sample_alert("cam-1:rule-1"), now)
            .await
            .unwrap();
        match duplicate {
            DedupDecision::Duplicate {
                existing_alert,
                seconds_until_expiry,
            } => {
                assert!(existing_alert.is_some());
                assert!(seconds_until_expiry > 0 && seconds_until_expiry <= 300);
            }
            other => panic!("expected duplicate, got {:?}", other),
        }

        // After the cooldown has passed the key can be reserved again
        let later = now + Duration::seconds(301);
        let renewed = store
            .reserve_and_insert_alert("cam-1:rule-1", 300, sample_alert("cam-1:rule-1"), later)
            .await
            .unwrap();
        assert!(matches!(renewed, DedupDecision::Created(_)));
    }

    #[tokio::test]
    async fn dedup_blocks_at_the_exact_expiry_instant() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .reserve_and_insert_alert("cam-1:rule-1", 300, sample_alert("cam-1:rule-1"), now)
            .await
            .unwrap();

        let boundary = now + Duration::seconds(300);
        let decision = store
            .reserve_and_insert_alert("cam-1:rule-1", 300, sample_alert("cam-1:rule-1"), boundary)
            .await
            .unwrap();
        match decision {
            DedupDecision::Duplicate {
                seconds_until_expiry,
                ..
            } => assert_eq!(seconds_until_expiry, 0),
            other => panic!("expected duplicate, got {:?}", other),
        }

        let renewed = store
            .reserve_and_insert_alert(
                "cam-1:rule-1",
                300,
                sample_alert("cam-1:rule-1"),
                now + Duration::seconds(301),
            )
            .await
            .unwrap();
        assert!(matches!(renewed, DedupDecision::Created(_)));
    }

    #[tokio::test]
    async fn mark_alert_delivered_updates_status() {
        let store = MemoryStore::new();
        let alert = sample_alert("k");
        let id = alert.id;
        store
            .reserve_and_insert_alert("k", 60, alert, Utc::now())
            .await
            .unwrap();

        store.mark_alert_delivered(id, Utc::now()).await.unwrap();
        let stored = store.get_alert(id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Delivered);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn list_enabled_rules_skips_disabled() {
        let store = MemoryStore::new();
        let mut rule: AlertRule = serde_json::from_value(serde_json::json!({
            "id": "rule-1",
            "name": "one",
            "severity": "info",
            "dedup_key_template": "{rule_id}"
        }))
        .unwrap();
        store.upsert_rule(rule.clone()).await.unwrap();

        rule.id = "rule-2".to_string();
        rule.enabled = false;
        store.upsert_rule(rule).await.unwrap();

        let rules = store.list_enabled_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "rule-1");
    }
}
