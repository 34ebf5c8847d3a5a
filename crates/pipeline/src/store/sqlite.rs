use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    store::{
        Alert, AlertRule, AlertStatus, AppendOutcome, ClosedBatch, DeadLetterEntry,
        DeadLetterOutcome, DedupDecision, Detection, Store, TrackedBatch, overflow_queue,
    },
    Error, Result,
};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to SQLite database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(Error::Sqlx)?
            .create_if_missing(true);

        // An in-memory database lives and dies with its connection, so the
        // pool must hold exactly one and never recycle it.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        } else {
            SqlitePool::connect_with(options).await
        }
        .map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    // Batch operations
    async fn append_detection(
        &self,
        detection: &Detection,
        candidate_batch_id: &str,
        now: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Result<AppendOutcome> {
        debug!(
            "Appending detection {} for source {}",
            detection.detection_id, detection.source_id
        );

        let expires_at = now + Duration::seconds(ttl_seconds);
        let mut tx = self.pool.begin().await?;

        // Get-or-create the batch pointer. The insert is the creation race:
        // exactly one concurrent caller wins, the rest read the winner's id.
        let claimed = sqlx::query(
            r#"
            INSERT INTO current_batches (source_id, batch_id, started_at, last_activity_at, expires_at)
            VALUES (?1, ?2, ?3, ?3, ?4)
            ON CONFLICT(source_id) DO NOTHING
            "#,
        )
        .bind(&detection.source_id)
        .bind(candidate_batch_id)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
        let created = claimed.rows_affected() == 1;

        let batch_id: String =
            sqlx::query_scalar("SELECT batch_id FROM current_batches WHERE source_id = ?1")
                .bind(&detection.source_id)
                .fetch_one(&mut *tx)
                .await?;

        if !created {
            sqlx::query(
                "UPDATE current_batches SET last_activity_at = ?2, expires_at = ?3 WHERE source_id = ?1",
            )
            .bind(&detection.source_id)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO batch_detections (batch_id, source_id, detection_id, object_type, confidence, added_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&batch_id)
        .bind(&detection.source_id)
        .bind(&detection.detection_id)
        .bind(&detection.object_type)
        .bind(detection.confidence)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let batch_len: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM batch_detections WHERE batch_id = ?1")
                .bind(&batch_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(AppendOutcome {
            batch_id,
            created,
            batch_len: batch_len as usize,
        })
    }

    async fn take_batch(&self, source_id: &str) -> Result<Option<ClosedBatch>> {
        debug!("Taking batch for source {}", source_id);

        let mut tx = self.pool.begin().await?;

        // Deleting the pointer decides the close race: whoever gets the row
        // owns the batch, everyone else sees None.
        let row = sqlx::query(
            r#"
            DELETE FROM current_batches
            WHERE source_id = ?1
            RETURNING batch_id, started_at, last_activity_at
            "#,
        )
        .bind(source_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let batch_id: String = row.get("batch_id");
        let started_at: DateTime<Utc> = row.get("started_at");
        let last_activity_at: DateTime<Utc> = row.get("last_activity_at");

        let detection_rows = sqlx::query(
            r#"
            SELECT source_id, detection_id, object_type, confidence
            FROM batch_detections
            WHERE batch_id = ?1
            ORDER BY id
            "#,
        )
        .bind(&batch_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM batch_detections WHERE batch_id = ?1")
            .bind(&batch_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let detections = detection_rows
            .iter()
            .map(|r| Detection {
                source_id: r.get("source_id"),
                detection_id: r.get("detection_id"),
                object_type: r.get("object_type"),
                confidence: r.get("confidence"),
            })
            .collect();

        Ok(Some(ClosedBatch {
            batch_id,
            source_id: source_id.to_string(),
            detections,
            started_at,
            last_activity_at,
        }))
    }

    async fn tracked_batches(&self) -> Result<Vec<TrackedBatch>> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, batch_id, started_at, last_activity_at
            FROM current_batches
            ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| TrackedBatch {
                source_id: r.get("source_id"),
                batch_id: r.get("batch_id"),
                started_at: r.get("started_at"),
                last_activity_at: r.get("last_activity_at"),
            })
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM batch_detections
            WHERE batch_id IN (SELECT batch_id FROM current_batches WHERE expires_at <= ?1)
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let purged = sqlx::query("DELETE FROM current_batches WHERE expires_at <= ?1")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let purged = purged.rows_affected();
        if purged > 0 {
            debug!("Purged {} expired batches", purged);
        }
        Ok(purged)
    }

    // Dead letter operations
    async fn push_dead_letter(
        &self,
        queue: &str,
        entry: &DeadLetterEntry,
        capacity: usize,
    ) -> Result<DeadLetterOutcome> {
        let original_job = serde_json::to_string(&entry.original_job)?;

        // Single guarded insert; the capacity check and the write cannot be
        // interleaved by another writer.
        let stored = sqlx::query(
            r#"
            INSERT INTO dead_letters (queue, original_job, error, attempts, failed_at)
            SELECT ?1, ?2, ?3, ?4, ?5
            WHERE (SELECT COUNT(*) FROM dead_letters WHERE queue = ?1) < ?6
            "#,
        )
        .bind(queue)
        .bind(&original_job)
        .bind(&entry.error)
        .bind(entry.attempts as i64)
        .bind(entry.failed_at)
        .bind(capacity as i64)
        .execute(&self.pool)
        .await?;

        if stored.rows_affected() == 1 {
            let len = self.dead_letter_len(queue).await?;
            return Ok(DeadLetterOutcome::Stored(len));
        }

        let overflow = overflow_queue(queue);
        sqlx::query(
            r#"
            INSERT INTO dead_letters (queue, original_job, error, attempts, failed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&overflow)
        .bind(&original_job)
        .bind(&entry.error)
        .bind(entry.attempts as i64)
        .bind(entry.failed_at)
        .execute(&self.pool)
        .await?;

        let len = self.dead_letter_len(&overflow).await?;
        Ok(DeadLetterOutcome::Overflowed(len))
    }

    async fn dead_letter_len(&self, queue: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE queue = ?1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn list_dead_letters(&self, queue: &str, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT original_job, error, attempts, failed_at
            FROM dead_letters
            WHERE queue = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for r in rows {
            let original_job: JsonValue = serde_json::from_str(r.get("original_job"))?;
            entries.push(DeadLetterEntry {
                original_job,
                error: r.get("error"),
                attempts: r.get::<i64, _>("attempts") as u32,
                failed_at: r.get("failed_at"),
            });
        }
        Ok(entries)
    }

    // Alert operations
    async fn reserve_and_insert_alert(
        &self,
        dedup_key: &str,
        cooldown_seconds: i64,
        alert: Alert,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        debug!("Reserving dedup key: {}", dedup_key);

        let expires_at = now + Duration::seconds(cooldown_seconds);
        let mut tx = self.pool.begin().await?;

        // Conditional upsert: take the key if it is free or its previous
        // reservation has strictly lapsed; a reservation at its exact expiry
        // instant still blocks. rows_affected decides who won.
        let reserved = sqlx::query(
            r#"
            INSERT INTO alert_dedup (dedup_key, alert_id, reserved_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(dedup_key) DO UPDATE SET
                alert_id = excluded.alert_id,
                reserved_at = excluded.reserved_at,
                expires_at = excluded.expires_at
            WHERE alert_dedup.expires_at < excluded.reserved_at
            "#,
        )
        .bind(dedup_key)
        .bind(alert.id.to_string())
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 1 {
            let channels_json = serde_json::to_string(&alert.channels)?;
            sqlx::query(
                r#"
                INSERT INTO alerts (
                    id, event_id, rule_id, source_id, severity, status,
                    dedup_key, risk_score, summary, channels, created_at, delivered_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(alert.id.to_string())
            .bind(alert.event_id.to_string())
            .bind(&alert.rule_id)
            .bind(&alert.source_id)
            .bind(alert.severity.to_string())
            .bind(alert.status.to_string())
            .bind(&alert.dedup_key)
            .bind(alert.risk_score)
            .bind(&alert.summary)
            .bind(channels_json)
            .bind(alert.created_at)
            .bind(alert.delivered_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(DedupDecision::Created(alert));
        }

        drop(tx);

        let row = sqlx::query("SELECT alert_id, expires_at FROM alert_dedup WHERE dedup_key = ?1")
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let alert_id: Uuid = r.get::<String, _>("alert_id").parse()?;
                let reservation_expires: DateTime<Utc> = r.get("expires_at");
                let existing_alert = self.get_alert(alert_id).await?;
                Ok(DedupDecision::Duplicate {
                    existing_alert,
                    seconds_until_expiry: (reservation_expires - now).num_seconds().max(0),
                })
            }
            // Reservation disappeared between the upsert and the read; treat
            // it as a duplicate rather than double-alerting.
            None => Ok(DedupDecision::Duplicate {
                existing_alert: None,
                seconds_until_expiry: 0,
            }),
        }
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        debug!("Getting alert: {}", id);

        let row = sqlx::query(
            r#"
            SELECT id, event_id, rule_id, source_id, severity, status,
                   dedup_key, risk_score, summary, channels, created_at, delivered_at
            FROM alerts
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_alert(&r)?)),
            None => Ok(None),
        }
    }

    async fn mark_alert_delivered(&self, id: Uuid, delivered_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE alerts SET status = ?1, delivered_at = ?2 WHERE id = ?3")
            .bind(AlertStatus::Delivered.to_string())
            .bind(delivered_at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, rule_id, source_id, severity, status,
                   dedup_key, risk_score, summary, channels, created_at, delivered_at
            FROM alerts
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for r in rows {
            alerts.push(row_to_alert(&r)?);
        }
        Ok(alerts)
    }

    // Rule operations
    async fn upsert_rule(&self, rule: AlertRule) -> Result<()> {
        debug!("Upserting rule: {}", rule.id);

        let object_types_json = rule
            .object_types
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let source_ids_json = rule
            .source_ids
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let schedule_json = rule
            .schedule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let channels_json = serde_json::to_string(&rule.channels)?;

        sqlx::query(
            r#"
            INSERT INTO alert_rules (
                id, name, enabled, severity, risk_threshold, object_types,
                source_ids, min_confidence, schedule, dedup_key_template,
                cooldown_seconds, channels, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                severity = excluded.severity,
                risk_threshold = excluded.risk_threshold,
                object_types = excluded.object_types,
                source_ids = excluded.source_ids,
                min_confidence = excluded.min_confidence,
                schedule = excluded.schedule,
                dedup_key_template = excluded.dedup_key_template,
                cooldown_seconds = excluded.cooldown_seconds,
                channels = excluded.channels,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(rule.severity.to_string())
        .bind(rule.risk_threshold)
        .bind(object_types_json)
        .bind(source_ids_json)
        .bind(rule.min_confidence)
        .bind(schedule_json)
        .bind(&rule.dedup_key_template)
        .bind(rule.cooldown_seconds)
        .bind(channels_json)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_enabled_rules(&self) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, enabled, severity, risk_threshold, object_types,
                   source_ids, min_confidence, schedule, dedup_key_template,
                   cooldown_seconds, channels, created_at, updated_at
            FROM alert_rules
            WHERE enabled = 1
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for r in rows {
            let object_types: Option<Vec<String>> = r
                .get::<Option<String>, _>("object_types")
                .map(|s| serde_json::from_str(&s))
                .transpose()?;
            let source_ids: Option<Vec<String>> = r
                .get::<Option<String>, _>("source_ids")
                .map(|s| serde_json::from_str(&s))
                .transpose()?;
            let schedule: Option<JsonValue> = r
                .get::<Option<String>, _>("schedule")
                .map(|s| serde_json::from_str(&s))
                .transpose()?;
            let channels: Vec<String> = serde_json::from_str(r.get("channels"))?;

            rules.push(AlertRule {
                id: r.get("id"),
                name: r.get("name"),
                enabled: r.get("enabled"),
                severity: r.get::<String, _>("severity").parse()?,
                risk_threshold: r.get("risk_threshold"),
                object_types,
                source_ids,
                min_confidence: r.get("min_confidence"),
                schedule,
                dedup_key_template: r.get("dedup_key_template"),
                cooldown_seconds: r.get("cooldown_seconds"),
                channels,
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            });
        }
        Ok(rules)
    }
}

fn row_to_alert(r: &SqliteRow) -> Result<Alert> {
    let channels: Vec<String> = serde_json::from_str(r.get("channels"))?;

    Ok(Alert {
        id: r.get::<String, _>("id").parse()?,
        event_id: r.get::<String, _>("event_id").parse()?,
        rule_id: r.get("rule_id"),
        source_id: r.get("source_id"),
        severity: r.get::<String, _>("severity").parse()?,
        status: r.get::<String, _>("status").parse()?,
        dedup_key: r.get("dedup_key"),
        risk_score: r.get("risk_score"),
        summary: r.get("summary"),
        channels,
        created_at: r.get("created_at"),
        delivered_at: r.get("delivered_at"),
    })
}
