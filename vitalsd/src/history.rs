//! Periodic metric history.
//!
//! Rows are immutable once written and only ever removed by age. The store
//! assigns timestamps (epoch millis); the caller decides how often to save
//! through [`SavePolicy`].

use crate::db::Database;
use crate::types::MetricSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Columns of `metrics_history` besides id and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryField {
    CpuUsage,
    CpuTemp,
    RamUsage,
    RamUsedGb,
    DiskUsage,
    DiskReadSpeed,
    DiskWriteSpeed,
    NetUpload,
    NetDownload,
    GpuUsage,
    GpuTemp,
}

impl HistoryField {
    pub const ALL: [HistoryField; 11] = [
        HistoryField::CpuUsage,
        HistoryField::CpuTemp,
        HistoryField::RamUsage,
        HistoryField::RamUsedGb,
        HistoryField::DiskUsage,
        HistoryField::DiskReadSpeed,
        HistoryField::DiskWriteSpeed,
        HistoryField::NetUpload,
        HistoryField::NetDownload,
        HistoryField::GpuUsage,
        HistoryField::GpuTemp,
    ];

    pub fn column(self) -> &'static str {
        match self {
            HistoryField::CpuUsage => "cpu_usage",
            HistoryField::CpuTemp => "cpu_temp",
            HistoryField::RamUsage => "ram_usage",
            HistoryField::RamUsedGb => "ram_used_gb",
            HistoryField::DiskUsage => "disk_usage",
            HistoryField::DiskReadSpeed => "disk_read_speed",
            HistoryField::DiskWriteSpeed => "disk_write_speed",
            HistoryField::NetUpload => "net_upload",
            HistoryField::NetDownload => "net_download",
            HistoryField::GpuUsage => "gpu_usage",
            HistoryField::GpuTemp => "gpu_temp",
        }
    }
}

impl fmt::Display for HistoryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for HistoryField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|field| field.column() == s)
            .ok_or_else(|| format!("unknown history field '{s}'"))
    }
}

/// One row's measurements. Network and disk rates are MB/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub cpu_usage: Option<f64>,
    pub cpu_temp: Option<f64>,
    pub ram_usage: Option<f64>,
    pub ram_used_gb: Option<f64>,
    pub disk_usage: Option<f64>,
    pub disk_read_speed: Option<f64>,
    pub disk_write_speed: Option<f64>,
    pub net_upload: Option<f64>,
    pub net_download: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub gpu_temp: Option<f64>,
}

impl MetricValues {
    pub fn from_snapshot(snapshot: &MetricSnapshot) -> Self {
        Self {
            cpu_usage: Some(f64::from(snapshot.cpu.usage)),
            cpu_temp: snapshot.cpu.temp.map(f64::from),
            ram_usage: Some(f64::from(snapshot.memory.percent)),
            ram_used_gb: Some(snapshot.memory.used as f64 / GIB),
            disk_usage: Some(f64::from(snapshot.disk.usage.percent)),
            disk_read_speed: Some(snapshot.disk.io.read_speed),
            disk_write_speed: Some(snapshot.disk.io.write_speed),
            net_upload: Some(snapshot.network.speed.upload / MIB),
            net_download: Some(snapshot.network.speed.download / MIB),
            gpu_usage: snapshot.gpu.as_ref().map(|gpu| f64::from(gpu.usage)),
            gpu_temp: snapshot.gpu.as_ref().map(|gpu| f64::from(gpu.temp)),
        }
    }

    pub fn get(&self, field: HistoryField) -> Option<f64> {
        match field {
            HistoryField::CpuUsage => self.cpu_usage,
            HistoryField::CpuTemp => self.cpu_temp,
            HistoryField::RamUsage => self.ram_usage,
            HistoryField::RamUsedGb => self.ram_used_gb,
            HistoryField::DiskUsage => self.disk_usage,
            HistoryField::DiskReadSpeed => self.disk_read_speed,
            HistoryField::DiskWriteSpeed => self.disk_write_speed,
            HistoryField::NetUpload => self.net_upload,
            HistoryField::NetDownload => self.net_download,
            HistoryField::GpuUsage => self.gpu_usage,
            HistoryField::GpuTemp => self.gpu_temp,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let get = |field: HistoryField| row.try_get::<Option<f64>, _>(field.column());
        Ok(Self {
            cpu_usage: get(HistoryField::CpuUsage)?,
            cpu_temp: get(HistoryField::CpuTemp)?,
            ram_usage: get(HistoryField::RamUsage)?,
            ram_used_gb: get(HistoryField::RamUsedGb)?,
            disk_usage: get(HistoryField::DiskUsage)?,
            disk_read_speed: get(HistoryField::DiskReadSpeed)?,
            disk_write_speed: get(HistoryField::DiskWriteSpeed)?,
            net_upload: get(HistoryField::NetUpload)?,
            net_download: get(HistoryField::NetDownload)?,
            gpu_usage: get(HistoryField::GpuUsage)?,
            gpu_temp: get(HistoryField::GpuTemp)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: MetricValues,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistorySummary {
    pub record_count: i64,
    pub metrics: BTreeMap<HistoryField, Aggregate>,
}

impl HistorySummary {
    pub fn get(&self, field: HistoryField) -> Aggregate {
        self.metrics.get(&field).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Save on every `n`th tick. `every(0)` never saves.
#[derive(Debug, Clone, Copy)]
pub struct SavePolicy {
    every: u64,
    ticks: u64,
}

impl SavePolicy {
    pub fn every(n: u64) -> Self {
        Self { every: n, ticks: 0 }
    }

    /// Count one tick; true when this tick should be persisted.
    pub fn tick(&mut self) -> bool {
        if self.every == 0 {
            return false;
        }
        self.ticks += 1;
        if self.ticks >= self.every {
            self.ticks = 0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn save(&self, values: &MetricValues) -> Result<i64, sqlx::Error> {
        self.save_at(values, Utc::now()).await
    }

    pub(crate) async fn save_at(
        &self,
        values: &MetricValues,
        at: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO metrics_history (
                timestamp, cpu_usage, cpu_temp, ram_usage, ram_used_gb, disk_usage,
                disk_read_speed, disk_write_speed, net_upload, net_download,
                gpu_usage, gpu_temp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(at.timestamp_millis())
        .bind(values.cpu_usage)
        .bind(values.cpu_temp)
        .bind(values.ram_usage)
        .bind(values.ram_used_gb)
        .bind(values.disk_usage)
        .bind(values.disk_read_speed)
        .bind(values.disk_write_speed)
        .bind(values.net_upload)
        .bind(values.net_download)
        .bind(values.gpu_usage)
        .bind(values.gpu_temp)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("[history] saved record #{id}");
        Ok(id)
    }

    /// Records inside the window, newest first, at most `limit` rows.
    pub async fn query(&self, since: Duration, limit: i64) -> Result<Vec<MetricRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM metrics_history
            WHERE timestamp >= ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(cutoff_millis(since))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// avg/min/max per field over the window. SQL aggregates skip NULLs, so
    /// a field that was never measured comes back as all `None`.
    pub async fn summary(&self, since: Duration) -> Result<HistorySummary, sqlx::Error> {
        let aggregates = HistoryField::ALL
            .iter()
            .map(|field| {
                let col = field.column();
                format!("AVG({col}), MIN({col}), MAX({col})")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let row = sqlx::query(&format!(
            "SELECT COUNT(*), {aggregates} FROM metrics_history WHERE timestamp >= ?"
        ))
        .bind(cutoff_millis(since))
        .fetch_one(&self.pool)
        .await?;

        let mut summary = HistorySummary {
            record_count: row.try_get(0)?,
            metrics: BTreeMap::new(),
        };
        for (i, field) in HistoryField::ALL.into_iter().enumerate() {
            let base = 1 + i * 3;
            summary.metrics.insert(
                field,
                Aggregate {
                    avg: row.try_get(base)?,
                    min: row.try_get(base + 1)?,
                    max: row.try_get(base + 2)?,
                },
            );
        }
        Ok(summary)
    }

    /// Delete rows strictly older than `older_than`. A zero window deletes
    /// everything. Returns the number of rows removed.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64, sqlx::Error> {
        if older_than.is_zero() {
            return self.clear_all().await;
        }
        let result = sqlx::query("DELETE FROM metrics_history WHERE timestamp < ?")
            .bind(cutoff_millis(older_than))
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!("[history] retention removed {deleted} records");
        }
        Ok(deleted)
    }

    pub async fn clear_all(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM metrics_history")
            .execute(&self.pool)
            .await?;
        info!("[history] cleared {} records", result.rows_affected());
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query("SELECT COUNT(*) FROM metrics_history")
            .fetch_one(&self.pool)
            .await
            .map(|r| r.get(0))
    }

    pub async fn latest(&self) -> Result<Option<MetricRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT * FROM metrics_history ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Oldest first, rows where the field is NULL skipped.
    pub async fn series(
        &self,
        field: HistoryField,
        since: Duration,
    ) -> Result<Vec<SeriesPoint>, sqlx::Error> {
        let col = field.column();
        let rows = sqlx::query(&format!(
            "SELECT timestamp, {col} FROM metrics_history \
             WHERE timestamp >= ? AND {col} IS NOT NULL \
             ORDER BY timestamp ASC, id ASC"
        ))
        .bind(cutoff_millis(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SeriesPoint {
                    timestamp: from_millis(row.try_get(0)?),
                    value: row.try_get(1)?,
                })
            })
            .collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<MetricRecord, sqlx::Error> {
    Ok(MetricRecord {
        id: row.try_get("id")?,
        timestamp: from_millis(row.try_get("timestamp")?),
        values: MetricValues::from_row(row)?,
    })
}

fn cutoff_millis(window: Duration) -> i64 {
    let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_sub(window)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3_600);

    async fn store() -> HistoryStore {
        HistoryStore::new(&Database::in_memory().await.unwrap())
    }

    fn cpu(value: Option<f64>) -> MetricValues {
        MetricValues {
            cpu_usage: value,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn summary_skips_nulls() {
        let store = store().await;
        store.save(&cpu(Some(10.0))).await.unwrap();
        store.save(&cpu(Some(20.0))).await.unwrap();
        store.save(&cpu(None)).await.unwrap();

        let summary = store.summary(HOUR).await.unwrap();
        assert_eq!(summary.record_count, 3);
        let agg = summary.get(HistoryField::CpuUsage);
        assert_eq!(agg.avg, Some(15.0));
        assert_eq!(agg.min, Some(10.0));
        assert_eq!(agg.max, Some(20.0));
        assert_eq!(summary.get(HistoryField::GpuTemp), Aggregate::default());
    }

    #[tokio::test]
    async fn query_is_windowed_newest_first_and_capped() {
        let store = store().await;
        let now = Utc::now();
        store
            .save_at(&cpu(Some(1.0)), now - chrono::Duration::hours(3))
            .await
            .unwrap();
        let a = store
            .save_at(&cpu(Some(2.0)), now - chrono::Duration::minutes(30))
            .await
            .unwrap();
        let b = store
            .save_at(&cpu(Some(3.0)), now - chrono::Duration::minutes(5))
            .await
            .unwrap();

        let records = store.query(HOUR, 100).await.unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b, a]);
        assert_eq!(store.query(HOUR, 1).await.unwrap().len(), 1);
        assert_eq!(store.latest().await.unwrap().map(|r| r.id), Some(b));
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_rows() {
        let store = store().await;
        let now = Utc::now();
        store
            .save_at(&cpu(Some(1.0)), now - chrono::Duration::days(8))
            .await
            .unwrap();
        store.save(&cpu(Some(2.0))).await.unwrap();

        let week = Duration::from_secs(7 * 86_400);
        assert_eq!(store.cleanup(week).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_zero_deletes_everything() {
        let store = store().await;
        for v in [1.0, 2.0, 3.0] {
            store.save(&cpu(Some(v))).await.unwrap();
        }
        let before = store.count().await.unwrap();
        assert_eq!(store.cleanup(Duration::ZERO).await.unwrap(), before as u64);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn series_is_oldest_first_without_nulls() {
        let store = store().await;
        let now = Utc::now();
        store
            .save_at(&cpu(Some(5.0)), now - chrono::Duration::minutes(2))
            .await
            .unwrap();
        store
            .save_at(&cpu(None), now - chrono::Duration::minutes(1))
            .await
            .unwrap();
        store.save_at(&cpu(Some(7.0)), now).await.unwrap();

        let points = store.series(HistoryField::CpuUsage, HOUR).await.unwrap();
        assert_eq!(
            points.iter().map(|p| p.value).collect::<Vec<_>>(),
            vec![5.0, 7.0]
        );
    }

    #[test]
    fn save_policy_counts_ticks() {
        let mut policy = SavePolicy::every(3);
        let saved: Vec<bool> = (0..6).map(|_| policy.tick()).collect();
        assert_eq!(saved, vec![false, false, true, false, false, true]);

        let mut never = SavePolicy::every(0);
        assert!((0..5).all(|_| !never.tick()));
        let mut always = SavePolicy::every(1);
        assert!((0..5).all(|_| always.tick()));
    }

    #[test]
    fn values_from_snapshot_use_mb_and_gb() {
        let mut snapshot = MetricSnapshot::default();
        snapshot.memory.used = 2 * 1024 * 1024 * 1024;
        snapshot.network.speed.upload = 3.0 * MIB;
        let values = MetricValues::from_snapshot(&snapshot);
        assert_eq!(values.ram_used_gb, Some(2.0));
        assert_eq!(values.net_upload, Some(3.0));
        assert_eq!(values.gpu_usage, None);
    }

    #[test]
    fn field_names_parse() {
        assert_eq!("ram_used_gb".parse::<HistoryField>(), Ok(HistoryField::RamUsedGb));
        assert!("swap".parse::<HistoryField>().is_err());
    }
}
