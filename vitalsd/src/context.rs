//! Everything the driver, the API and the admin commands share.

use crate::alerts::{AlertFeed, RuleStore};
use crate::config::Config;
use crate::db::Database;
use crate::history::HistoryStore;
use crate::metrics::Metrics;
use crate::processes::{ProcessInspector, ProcessQuery, ProcessRecord, ProcessStats};
use crate::sampler::gpu::GpuProbe;
use crate::sampler::{self, Sampler, SharedSampler};
use crate::settings::SettingsStore;
use crate::types::{GpuInfo, MetricSnapshot};
use log::warn;
use std::sync::{Arc, Mutex};

pub type SharedInspector = Arc<Mutex<ProcessInspector>>;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub sampler: SharedSampler,
    pub gpu: Arc<GpuProbe>,
    pub processes: SharedInspector,
    pub rules: RuleStore,
    pub history: HistoryStore,
    pub settings: SettingsStore,
    pub feed: Arc<AlertFeed>,
    pub metrics: Arc<Metrics>,
}

impl Context {
    /// Open the configured database and build every component.
    pub async fn new(config: Config) -> Result<Self, sqlx::Error> {
        let db = Database::connect(&config.storage.db_path).await?;
        Self::with_database(config, db).await
    }

    pub async fn with_database(config: Config, db: Database) -> Result<Self, sqlx::Error> {
        let settings = SettingsStore::new(&db).await?;
        let gpu = GpuProbe::new(config.sampler.gpu_timeout(), config.sampler.gpu_retry());
        let inspector = ProcessInspector::system(config.processes.prime_interval());
        // Priming blocks for sysinfo's minimum CPU interval.
        let sampler = tokio::task::spawn_blocking(Sampler::new)
            .await
            .map_err(|err| sqlx::Error::Protocol(format!("sampler init panicked: {err}")))?;

        Ok(Self {
            config: Arc::new(config),
            sampler: sampler.shared(),
            gpu: Arc::new(gpu),
            processes: Arc::new(Mutex::new(inspector)),
            rules: RuleStore::new(&db),
            history: HistoryStore::new(&db),
            settings,
            feed: Arc::new(AlertFeed::default()),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Full snapshot, GPU included.
    pub async fn snapshot(&self) -> MetricSnapshot {
        sampler::collect(&self.sampler, &self.gpu).await
    }

    pub async fn gpu_info(&self) -> Option<GpuInfo> {
        self.gpu.read().await
    }

    pub async fn list_processes(&self, query: ProcessQuery) -> Vec<ProcessRecord> {
        self.with_inspector(move |inspector| inspector.list(&query))
            .await
            .unwrap_or_default()
    }

    /// Highest CPU users first.
    pub async fn top_processes(&self, n: usize) -> Vec<ProcessRecord> {
        self.with_inspector(move |inspector| inspector.top_cpu(n))
            .await
            .unwrap_or_default()
    }

    pub async fn process_stats(&self) -> ProcessStats {
        self.with_inspector(|inspector| inspector.stats())
            .await
            .unwrap_or_default()
    }

    /// Run on the blocking pool; listings sleep between their two passes.
    async fn with_inspector<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProcessInspector) -> T + Send + 'static,
    {
        let inspector = Arc::clone(&self.processes);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = inspector
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await;
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("[processes] inspector task failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_against_in_memory_database() {
        let ctx = Context::with_database(Config::default(), Database::in_memory().await.unwrap())
            .await
            .unwrap();
        assert_eq!(ctx.rules.count().await.unwrap(), 0);
        assert_eq!(ctx.settings.get("theme").await.unwrap().as_deref(), Some("dark"));

        let snapshot = ctx.snapshot().await;
        assert!(snapshot.timestamp > 0);
        assert!(ctx.process_stats().await.total >= 1);
        assert!(ctx.top_processes(3).await.len() <= 3);
    }
}
