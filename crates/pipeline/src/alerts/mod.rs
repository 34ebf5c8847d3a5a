mod dedup;
mod engine;
mod schedule;
mod template;

pub use dedup::AlertDedup;
pub use engine::AlertEngine;
pub use schedule::RuleSchedule;
pub use template::render_dedup_key;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::store::{AlertRule, Detection, Store};
use crate::analysis::RiskAssessment;
use crate::Result;

/// Scored incident handed to the alert engine: one closed batch (or one
/// fast-path detection) plus its risk assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub event_id: Uuid,
    pub batch_id: String,
    pub source_id: String,
    pub detections: Vec<Detection>,
    pub risk: RiskAssessment,
    pub is_fast_path: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Load alert rules from a JSON file into the store. Deployment seeding
/// only; rule CRUD lives outside this service.
pub async fn seed_rules(store: &dyn Store, path: &str) -> Result<usize> {
    let raw = std::fs::read_to_string(path)?;
    let rules: Vec<AlertRule> = serde_json::from_str(&raw)?;
    let count = rules.len();
    for rule in rules {
        store.upsert_rule(rule).await?;
    }
    info!("Seeded {} alert rules from {}", count, path);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use crate::store::MemoryStore;

    #[tokio::test]
    async fn seed_rules_loads_enabled_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{
                    "id": "high-risk",
                    "name": "High risk incident",
                    "severity": "critical",
                    "risk_threshold": 70,
                    "dedup_key_template": "{{source_id}}:{{rule_id}}"
                }},
                {{
                    "id": "disabled",
                    "name": "Disabled rule",
                    "enabled": false,
                    "severity": "info",
                    "dedup_key_template": "{{rule_id}}"
                }}
            ]"#
        )
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let count = seed_rules(store.as_ref(), file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(count, 2);

        let enabled = store.list_enabled_rules().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "high-risk");
    }

    #[tokio::test]
    async fn seed_rules_rejects_malformed_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let store = MemoryStore::new();
        assert!(seed_rules(&store, file.path().to_str().unwrap())
            .await
            .is_err());
    }
}
