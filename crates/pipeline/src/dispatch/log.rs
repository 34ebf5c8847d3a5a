use async_trait::async_trait;
use tracing::info;

use super::{ChannelDelivery, NotificationDispatcher};
use crate::store::Alert;

/// Dispatcher that writes one structured log line per channel. Default
/// destination when no external notification service is configured.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn deliver(&self, alert: &Alert) -> Vec<ChannelDelivery> {
        alert
            .channels
            .iter()
            .map(|channel| {
                info!(
                    alert_id = %alert.id,
                    rule_id = %alert.rule_id,
                    source_id = %alert.source_id,
                    severity = %alert.severity,
                    risk_score = alert.risk_score,
                    channel = %channel,
                    "Alert delivered"
                );
                ChannelDelivery::ok(channel)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::store::{AlertSeverity, AlertStatus};

    fn sample_alert(channels: Vec<String>) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            rule_id: "rule-1".to_string(),
            source_id: "cam-1".to_string(),
            severity: AlertSeverity::Warning,
            status: AlertStatus::Pending,
            dedup_key: "cam-1:rule-1".to_string(),
            risk_score: 70,
            summary: Some("Person detected".to_string()),
            channels,
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_every_channel() {
        let dispatcher = LogDispatcher;
        let alert = sample_alert(vec!["ops".to_string(), "security".to_string()]);

        let deliveries = dispatcher.deliver(&alert).await;
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(ChannelDelivery::succeeded));
    }

    #[tokio::test]
    async fn channel_less_alert_yields_no_deliveries() {
        let dispatcher = LogDispatcher;
        let alert = sample_alert(vec![]);

        assert!(dispatcher.deliver(&alert).await.is_empty());
    }
}
