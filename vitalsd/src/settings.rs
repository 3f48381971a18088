//! User preferences as a flat key/value table.

use crate::db::Database;
use log::warn;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub const THEME: &str = "theme";
pub const UPDATE_INTERVAL_MS: &str = "update_interval_ms";
pub const HISTORY_RETENTION_DAYS: &str = "history_retention_days";
pub const ENABLE_NOTIFICATIONS: &str = "enable_notifications";
pub const ENABLE_SOUNDS: &str = "enable_sounds";
pub const LANGUAGE: &str = "language";

pub const DEFAULTS: [(&str, &str); 6] = [
    (THEME, "dark"),
    (UPDATE_INTERVAL_MS, "1000"),
    (HISTORY_RETENTION_DAYS, "7"),
    (ENABLE_NOTIFICATIONS, "true"),
    (ENABLE_SOUNDS, "true"),
    (LANGUAGE, "en"),
];

/// Floor for the sampling interval; faster ticks only produce CPU noise.
const MIN_INTERVAL_MS: u64 = 200;

#[derive(Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    /// Opens the store and inserts any missing defaults. Existing values are
    /// never overwritten.
    pub async fn new(db: &Database) -> Result<Self, sqlx::Error> {
        let store = Self {
            pool: db.pool().clone(),
        };
        store.seed_defaults().await?;
        Ok(store)
    }

    async fn seed_defaults(&self) -> Result<(), sqlx::Error> {
        for (key, value) in DEFAULTS {
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn get_or(&self, key: &str, default: &str) -> Result<String, sqlx::Error> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }

    pub async fn all(&self) -> Result<BTreeMap<String, String>, sqlx::Error> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!("[settings] {key} = {value}");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop every stored value and restore the defaults.
    pub async fn reset(&self) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM settings")
            .execute(&self.pool)
            .await?;
        self.seed_defaults().await?;
        info!("[settings] reset to defaults");
        Ok(())
    }

    pub async fn update_interval(&self) -> Result<Duration, sqlx::Error> {
        let ms: u64 = self.parsed(UPDATE_INTERVAL_MS).await?;
        Ok(Duration::from_millis(ms.max(MIN_INTERVAL_MS)))
    }

    pub async fn retention(&self) -> Result<Duration, sqlx::Error> {
        let days: u64 = self.parsed(HISTORY_RETENTION_DAYS).await?;
        Ok(Duration::from_secs(days.saturating_mul(86_400)))
    }

    pub async fn notifications_enabled(&self) -> Result<bool, sqlx::Error> {
        self.parsed(ENABLE_NOTIFICATIONS).await
    }

    pub async fn sounds_enabled(&self) -> Result<bool, sqlx::Error> {
        self.parsed(ENABLE_SOUNDS).await
    }

    /// Stored value parsed as `T`, falling back to the default when the
    /// stored text is missing or malformed.
    async fn parsed<T: FromStr>(&self, key: &str) -> Result<T, sqlx::Error> {
        let default = default_for(key);
        let raw = self.get(key).await?;
        if let Some(raw) = &raw {
            match raw.trim().parse() {
                Ok(value) => return Ok(value),
                Err(_) => warn!("[settings] malformed {key}='{raw}', using default '{default}'"),
            }
        }
        default
            .parse()
            .map_err(|_| sqlx::Error::Protocol(format!("bad default for {key}")))
    }
}

pub fn default_for(key: &str) -> &'static str {
    DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or("")
}
