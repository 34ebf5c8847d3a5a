use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::schedule::RuleSchedule;
use super::template::render_dedup_key;
use super::{AlertDedup, IncidentEvent};
use crate::dispatch::NotificationDispatcher;
use crate::store::{Alert, AlertRule, AlertStatus, DedupDecision, Store};
use crate::{metrics, Result};

/// Evaluates scored incidents against the configured alert rules.
///
/// Rules are independent: each one matches, dedups and dispatches on its
/// own, and a failure in one rule (malformed schedule, bad template) never
/// blocks the others.
pub struct AlertEngine {
    store: Arc<dyn Store>,
    dedup: AlertDedup,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        let dedup = AlertDedup::new(Arc::clone(&store));
        Self {
            store,
            dedup,
            dispatcher,
        }
    }

    pub async fn evaluate_event(&self, event: &IncidentEvent) -> Result<Vec<Alert>> {
        self.evaluate_event_at(event, Utc::now()).await
    }

    pub async fn evaluate_event_at(
        &self,
        event: &IncidentEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let rules = self.store.list_enabled_rules().await?;
        debug!(
            "Evaluating event {} against {} rules",
            event.event_id,
            rules.len()
        );

        let mut alerts = Vec::new();
        for rule in &rules {
            match self.apply_rule(rule, event, now).await {
                Ok(Some(alert)) => alerts.push(alert),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Rule '{}' failed for event {}: {}",
                        rule.name, event.event_id, e
                    );
                }
            }
        }
        Ok(alerts)
    }

    async fn apply_rule(
        &self,
        rule: &AlertRule,
        event: &IncidentEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        if !Self::matches(rule, event, now)? {
            return Ok(None);
        }

        let dedup_key = render_dedup_key(&rule.dedup_key_template, rule, event)?;
        let alert = Alert {
            id: Uuid::new_v4(),
            event_id: event.event_id,
            rule_id: rule.id.clone(),
            source_id: event.source_id.clone(),
            severity: rule.severity,
            status: AlertStatus::Pending,
            dedup_key: dedup_key.clone(),
            risk_score: event.risk.risk_score,
            summary: Some(event.risk.summary.clone()),
            channels: rule.channels.clone(),
            created_at: now,
            delivered_at: None,
        };

        match self
            .dedup
            .check(&dedup_key, rule.cooldown_seconds, alert, now)
            .await?
        {
            DedupDecision::Created(alert) => {
                metrics::ALERTS_CREATED_TOTAL.inc();
                info!(
                    "Alert {} created for rule '{}' on {} (risk {})",
                    alert.id, rule.name, alert.source_id, alert.risk_score
                );
                let alert = self.dispatch(alert, now).await?;
                Ok(Some(alert))
            }
            DedupDecision::Duplicate {
                seconds_until_expiry,
                ..
            } => {
                metrics::ALERTS_SUPPRESSED_TOTAL.inc();
                debug!(
                    "Suppressed duplicate '{}' for rule '{}' ({}s of cooldown left)",
                    dedup_key, rule.name, seconds_until_expiry
                );
                Ok(None)
            }
        }
    }

    /// All set conditions must hold; an unset condition places no
    /// restriction. The detection-level conditions (`object_types`,
    /// `min_confidence`) must be satisfied by one and the same detection.
    fn matches(rule: &AlertRule, event: &IncidentEvent, now: DateTime<Utc>) -> Result<bool> {
        if let Some(threshold) = rule.risk_threshold {
            if event.risk.risk_score < threshold {
                return Ok(false);
            }
        }

        if let Some(ref sources) = rule.source_ids {
            if !sources.iter().any(|s| s == &event.source_id) {
                return Ok(false);
            }
        }

        if rule.object_types.is_some() || rule.min_confidence.is_some() {
            let hit = event.detections.iter().any(|d| {
                let type_ok = rule
                    .object_types
                    .as_ref()
                    .map_or(true, |types| types.iter().any(|t| t == &d.object_type));
                let confidence_ok = rule.min_confidence.map_or(true, |min| d.confidence >= min);
                type_ok && confidence_ok
            });
            if !hit {
                return Ok(false);
            }
        }

        if let Some(ref value) = rule.schedule {
            let schedule = RuleSchedule::from_value(value)?;
            if !schedule.contains(now) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn dispatch(&self, mut alert: Alert, now: DateTime<Utc>) -> Result<Alert> {
        let deliveries = self.dispatcher.deliver(&alert).await;
        for delivery in &deliveries {
            if let Some(ref error) = delivery.error {
                warn!(
                    "Delivery to '{}' failed for alert {}: {}",
                    delivery.channel, alert.id, error
                );
            }
        }

        // A channel-less rule has nothing to deliver and counts as delivered
        let delivered = alert.channels.is_empty() || deliveries.iter().any(|d| d.succeeded());
        if delivered {
            self.store.mark_alert_delivered(alert.id, now).await?;
            alert.status = AlertStatus::Delivered;
            alert.delivered_at = Some(now);
        }
        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    use crate::analysis::{RiskAssessment, RiskLevel};
    use crate::dispatch::{ChannelDelivery, LogDispatcher, MockNotificationDispatcher};
    use crate::store::{Detection, MemoryStore};

    fn make_rule(id: &str, overrides: serde_json::Value) -> AlertRule {
        let mut base = json!({
            "id": id,
            "name": format!("Rule {}", id),
            "severity": "warning",
            "dedup_key_template": "{source_id}:{rule_id}"
        });
        base.as_object_mut()
            .unwrap()
            .extend(overrides.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    fn make_event(source_id: &str, risk_score: i64, detections: Vec<Detection>) -> IncidentEvent {
        IncidentEvent {
            event_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            detections,
            risk: RiskAssessment {
                risk_score,
                risk_level: RiskLevel::High,
                summary: "suspicious activity".to_string(),
                reasoning: "test".to_string(),
            },
            is_fast_path: false,
            occurred_at: Utc::now(),
        }
    }

    async fn engine_with_rules(rules: Vec<AlertRule>) -> (AlertEngine, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        for rule in rules {
            store.upsert_rule(rule).await.unwrap();
        }
        let engine = AlertEngine::new(Arc::clone(&store), Arc::new(LogDispatcher));
        (engine, store)
    }

    #[tokio::test]
    async fn rule_with_no_conditions_matches_everything() {
        let (engine, _store) = engine_with_rules(vec![make_rule("r1", json!({}))]).await;
        let event = make_event("cam-1", 10, vec![]);

        let alerts = engine.evaluate_event_at(&event, Utc::now()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "r1");
        // No channels configured, so the alert is immediately delivered
        assert_eq!(alerts[0].status, AlertStatus::Delivered);
    }

    #[tokio::test]
    async fn risk_threshold_filters_low_scores() {
        let (engine, _store) =
            engine_with_rules(vec![make_rule("r1", json!({ "risk_threshold": 70 }))]).await;

        let low = make_event("cam-1", 69, vec![]);
        assert!(engine.evaluate_event_at(&low, Utc::now()).await.unwrap().is_empty());

        let high = make_event("cam-2", 70, vec![]);
        assert_eq!(engine.evaluate_event_at(&high, Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detection_conditions_must_hold_on_one_detection() {
        let (engine, _store) = engine_with_rules(vec![make_rule(
            "r1",
            json!({ "object_types": ["person"], "min_confidence": 0.8 }),
        )])
        .await;

        // A confident car and a hesitant person: no single detection passes both
        let split = make_event(
            "cam-1",
            80,
            vec![
                Detection::new("cam-1", "d1", "car", 0.95),
                Detection::new("cam-1", "d2", "person", 0.5),
            ],
        );
        assert!(engine.evaluate_event_at(&split, Utc::now()).await.unwrap().is_empty());

        let combined = make_event(
            "cam-1",
            80,
            vec![Detection::new("cam-1", "d3", "person", 0.9)],
        );
        assert_eq!(
            engine.evaluate_event_at(&combined, Utc::now()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn source_filter_restricts_cameras() {
        let (engine, _store) =
            engine_with_rules(vec![make_rule("r1", json!({ "source_ids": ["cam-1"] }))]).await;

        assert_eq!(
            engine
                .evaluate_event_at(&make_event("cam-1", 50, vec![]), Utc::now())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(engine
            .evaluate_event_at(&make_event("cam-2", 50, vec![]), Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn schedule_gates_by_evaluation_time() {
        let (engine, _store) = engine_with_rules(vec![make_rule(
            "night",
            json!({ "schedule": { "start_time": "22:00:00", "end_time": "06:00:00" } }),
        )])
        .await;
        let event = make_event("cam-1", 50, vec![]);

        let night = Utc.with_ymd_and_hms(2025, 6, 3, 2, 0, 0).unwrap();
        assert_eq!(engine.evaluate_event_at(&event, night).await.unwrap().len(), 1);

        let noon = Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap();
        assert!(engine.evaluate_event_at(&event, noon).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_rule_does_not_block_others() {
        let (engine, _store) = engine_with_rules(vec![
            make_rule("broken", json!({ "schedule": { "start_time": "not a time" } })),
            make_rule("ok", json!({})),
        ])
        .await;
        let event = make_event("cam-1", 50, vec![]);

        let alerts = engine.evaluate_event_at(&event, Utc::now()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "ok");
    }

    #[tokio::test]
    async fn duplicate_events_are_suppressed_within_cooldown() {
        let (engine, _store) =
            engine_with_rules(vec![make_rule("r1", json!({ "cooldown_seconds": 300 }))]).await;
        let t0 = Utc::now();

        let first = engine
            .evaluate_event_at(&make_event("cam-1", 50, vec![]), t0)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Same source and rule one second later shares the dedup key
        let second = engine
            .evaluate_event_at(&make_event("cam-1", 60, vec![]), t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(second.is_empty());

        // A different source renders a different key
        let other = engine
            .evaluate_event_at(&make_event("cam-2", 60, vec![]), t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(other.len(), 1);

        // Past the cooldown the key is free again
        let third = engine
            .evaluate_event_at(&make_event("cam-1", 60, vec![]), t0 + chrono::Duration::seconds(301))
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn multiple_rules_alert_independently() {
        let (engine, _store) = engine_with_rules(vec![
            make_rule("r1", json!({ "risk_threshold": 40 })),
            make_rule("r2", json!({ "risk_threshold": 40, "severity": "critical" })),
        ])
        .await;

        let alerts = engine
            .evaluate_event_at(&make_event("cam-1", 50, vec![]), Utc::now())
            .await
            .unwrap();
        assert_eq!(alerts.len(), 2);
    }

    #[tokio::test]
    async fn partial_delivery_still_marks_delivered() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .upsert_rule(make_rule("r1", json!({ "channels": ["ops", "security"] })))
            .await
            .unwrap();

        let mut dispatcher = MockNotificationDispatcher::new();
        dispatcher.expect_deliver().returning(|_| {
            vec![
                ChannelDelivery::failed("ops", "webhook down"),
                ChannelDelivery::ok("security"),
            ]
        });

        let engine = AlertEngine::new(Arc::clone(&store), Arc::new(dispatcher));
        let alerts = engine
            .evaluate_event_at(&make_event("cam-1", 50, vec![]), Utc::now())
            .await
            .unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Delivered);
        assert!(alerts[0].delivered_at.is_some());

        let stored = store.get_alert(alerts[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Delivered);
    }

    #[tokio::test]
    async fn total_delivery_failure_leaves_alert_pending() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .upsert_rule(make_rule("r1", json!({ "channels": ["ops"] })))
            .await
            .unwrap();

        let mut dispatcher = MockNotificationDispatcher::new();
        dispatcher
            .expect_deliver()
            .returning(|_| vec![ChannelDelivery::failed("ops", "webhook down")]);

        let engine = AlertEngine::new(Arc::clone(&store), Arc::new(dispatcher));
        let alerts = engine
            .evaluate_event_at(&make_event("cam-1", 50, vec![]), Utc::now())
            .await
            .unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Pending);
        assert!(alerts[0].delivered_at.is_none());
    }
}
