//! Alert rule persistence.

use super::{AlertRule, Metric, Operator, RulePatch, RuleSpec};
use crate::db::Database;
use crate::error::RuleError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

const COLUMNS: &str = "id, name, metric, operator, threshold, enabled, notify_sound, \
                       trigger_count, last_triggered, created_at";

#[derive(Clone)]
pub struct RuleStore {
    pool: SqlitePool,
}

impl RuleStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Validate and insert a rule. Nothing is written when validation fails.
    pub async fn create(&self, spec: &RuleSpec) -> Result<AlertRule, RuleError> {
        spec.validate()?;
        let created_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO alerts (name, metric, operator, threshold, enabled, notify_sound,
                                trigger_count, last_triggered, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?)
            "#,
        )
        .bind(spec.name.trim())
        .bind(spec.metric.as_str())
        .bind(spec.operator.as_str())
        .bind(spec.threshold)
        .bind(spec.enabled)
        .bind(spec.notify_sound)
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(
            "[alerts] created rule #{id} '{}' ({} {} {})",
            spec.name, spec.metric, spec.operator, spec.threshold
        );
        self.get(id).await?.ok_or(RuleError::NotFound(id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<AlertRule>, sqlx::Error> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM alerts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    /// Newest first.
    pub async fn list(&self, only_enabled: bool) -> Result<Vec<AlertRule>, sqlx::Error> {
        let filter = if only_enabled { "WHERE enabled = 1" } else { "" };
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM alerts {filter} ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    /// Apply the fields present in `patch`. Returns `false` when the patch
    /// is empty or the rule does not exist.
    pub async fn update(&self, id: i64, patch: &RulePatch) -> Result<bool, RuleError> {
        patch.validate()?;
        if patch.is_empty() {
            return Ok(false);
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE alerts SET ");
        let mut fields = query.separated(", ");
        if let Some(name) = &patch.name {
            fields.push("name = ").push_bind_unseparated(name.trim().to_string());
        }
        if let Some(metric) = patch.metric {
            fields.push("metric = ").push_bind_unseparated(metric.as_str());
        }
        if let Some(operator) = patch.operator {
            fields.push("operator = ").push_bind_unseparated(operator.as_str());
        }
        if let Some(threshold) = patch.threshold {
            fields.push("threshold = ").push_bind_unseparated(threshold);
        }
        if let Some(enabled) = patch.enabled {
            fields.push("enabled = ").push_bind_unseparated(enabled);
        }
        if let Some(notify_sound) = patch.notify_sound {
            fields.push("notify_sound = ").push_bind_unseparated(notify_sound);
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(&self.pool).await?;
        let updated = result.rows_affected() > 0;
        if updated {
            debug!("[alerts] updated rule #{id}");
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM alerts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!("[alerts] deleted rule #{id}");
        }
        Ok(deleted)
    }

    pub async fn delete_all(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM alerts")
            .execute(&self.pool)
            .await?;
        info!("[alerts] deleted {} rules", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Flip `enabled`; returns the new state, or `None` for an unknown id.
    pub async fn toggle(&self, id: i64) -> Result<Option<bool>, sqlx::Error> {
        let row = sqlx::query(
            "UPDATE alerts SET enabled = 1 - enabled WHERE id = ? RETURNING enabled",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<bool, _>(0)))
    }

    /// Bump the trigger counter. Called only on a NORMAL to ALERTING edge.
    pub async fn record_trigger(&self, id: i64, at: DateTime<Utc>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE alerts SET trigger_count = trigger_count + 1, last_triggered = ? WHERE id = ?",
        )
        .bind(at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await
            .map(|r| r.get(0))
    }
}

fn rule_from_row(row: &SqliteRow) -> Result<AlertRule, sqlx::Error> {
    let metric: String = row.try_get("metric")?;
    let operator: String = row.try_get("operator")?;
    let trigger_count: i64 = row.try_get("trigger_count")?;
    let last_triggered: Option<i64> = row.try_get("last_triggered")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(AlertRule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        metric: metric
            .parse::<Metric>()
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
        operator: operator
            .parse::<Operator>()
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
        threshold: row.try_get("threshold")?,
        enabled: row.try_get("enabled")?,
        notify_sound: row.try_get("notify_sound")?,
        trigger_count: trigger_count.max(0) as u64,
        last_triggered: last_triggered.and_then(DateTime::from_timestamp_millis),
        created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
    })
}
