use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Daemon self-counters, served on `/status`.
pub struct Metrics {
    started_at: u64,
    ticks: AtomicU64,
    tick_failures: AtomicU64,
    history_saves: AtomicU64,
    history_failures: AtomicU64,
    history_pruned: AtomicU64,
    alerts_fired: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_suppressed: AtomicU64,
    last_tick_at: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub status: &'static str,
    pub started_at: u64,
    pub uptime_secs: u64,
    pub ticks: u64,
    pub tick_failures: u64,
    pub history_saves: u64,
    pub history_failures: u64,
    pub history_pruned: u64,
    pub alerts_fired: u64,
    pub notifications_sent: u64,
    pub notifications_suppressed: u64,
    pub last_tick_at: Option<u64>,
    pub last_error: Option<String>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: now_secs(),
            ticks: AtomicU64::new(0),
            tick_failures: AtomicU64::new(0),
            history_saves: AtomicU64::new(0),
            history_failures: AtomicU64::new(0),
            history_pruned: AtomicU64::new(0),
            alerts_fired: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_suppressed: AtomicU64::new(0),
            last_tick_at: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.last_tick_at.store(now_secs(), Ordering::Relaxed);
    }

    /// A tick step failed; the driver keeps going but the error stays
    /// visible until a clean tick clears it.
    pub fn record_failure(&self, error: impl Into<String>) {
        self.tick_failures.fetch_add(1, Ordering::Relaxed);
        *self.error_slot() = Some(error.into());
    }

    pub fn clear_error(&self) {
        *self.error_slot() = None;
    }

    pub fn inc_history_saves(&self) {
        self.history_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_history_failures(&self) {
        self.history_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_history_pruned(&self, rows: u64) {
        self.history_pruned.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn inc_alerts_fired(&self) {
        self.alerts_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications_suppressed(&self) {
        self.notifications_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.error_slot().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_error = self.last_error();
        let last_tick_at = self.last_tick_at.load(Ordering::Relaxed);
        MetricsSnapshot {
            status: if last_error.is_some() { "degraded" } else { "ok" },
            started_at: self.started_at,
            uptime_secs: now_secs().saturating_sub(self.started_at),
            ticks: self.ticks(),
            tick_failures: self.tick_failures.load(Ordering::Relaxed),
            history_saves: self.history_saves.load(Ordering::Relaxed),
            history_failures: self.history_failures.load(Ordering::Relaxed),
            history_pruned: self.history_pruned.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_suppressed: self.notifications_suppressed.load(Ordering::Relaxed),
            last_tick_at: (last_tick_at > 0).then_some(last_tick_at),
            last_error,
        }
    }

    fn error_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_degrade_until_cleared() {
        let metrics = Metrics::new();
        metrics.record_tick();
        assert_eq!(metrics.snapshot().status, "ok");

        metrics.record_failure("history save failed: disk full");
        let snap = metrics.snapshot();
        assert_eq!(snap.status, "degraded");
        assert_eq!(snap.tick_failures, 1);
        assert_eq!(snap.last_error.as_deref(), Some("history save failed: disk full"));

        metrics.clear_error();
        assert_eq!(metrics.snapshot().status, "ok");
        assert_eq!(metrics.snapshot().tick_failures, 1);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.inc_alerts_fired();
        metrics.inc_alerts_fired();
        metrics.inc_notifications_suppressed();
        metrics.add_history_pruned(12);
        let snap = metrics.snapshot();
        assert_eq!(snap.alerts_fired, 2);
        assert_eq!(snap.notifications_suppressed, 1);
        assert_eq!(snap.history_pruned, 12);
        assert_eq!(snap.last_tick_at, None);
    }
}
