//! The periodic loop: sample, evaluate alerts, persist, notify.
//!
//! This is the only caller of [`AlertEngine::evaluate`]. A failing step is
//! logged, counted and surfaced on `/status`; the loop itself never stops
//! on an error.

use crate::alerts::{AlertEngine, Delivery, LogSink, MetricSample, NotificationSink, Notifier, NotifyPrefs};
use crate::context::Context;
use crate::history::{MetricValues, SavePolicy};
use crate::types::MetricSnapshot;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub fired: usize,
    pub notified: usize,
    pub recovered: usize,
    pub saved: Option<i64>,
    pub pruned: u64,
    pub errors: Vec<String>,
}

pub struct Driver {
    ctx: Context,
    engine: AlertEngine,
    notifier: Notifier,
    save_policy: SavePolicy,
    cleanup_every: u64,
    ticks: u64,
}

impl Driver {
    pub fn new(ctx: Context) -> Self {
        let notifier = Notifier::new(ctx.config.alerts.cooldown(), Arc::clone(&ctx.feed))
            .with_sink(Arc::new(LogSink));
        Self {
            engine: AlertEngine::new(ctx.rules.clone()),
            save_policy: SavePolicy::every(ctx.config.sampler.history_every_ticks),
            cleanup_every: ctx.config.sampler.cleanup_every_ticks,
            notifier,
            ticks: 0,
            ctx,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = self.notifier.with_sink(sink);
        self
    }

    /// Tick until `shutdown` resolves. The period comes from the
    /// `update_interval_ms` setting, or the config file if that cannot be read.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = match self.ctx.settings.update_interval().await {
            Ok(period) => period,
            Err(err) => {
                warn!("[driver] could not read update interval: {err}");
                self.ctx.config.sampler.interval()
            }
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!("[driver] sampling every {period:?}");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[driver] stopping after {} ticks", self.ticks);
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick_once().await;
                    if report.fired > 0 {
                        debug!("[driver] tick {}: {report:?}", self.ticks);
                    }
                }
            }
        }
    }

    /// Sample the host and process the result.
    pub async fn tick_once(&mut self) -> TickReport {
        let snapshot = self.ctx.snapshot().await;
        self.process(&snapshot).await
    }

    /// Everything after sampling, for a snapshot from any source.
    pub async fn process(&mut self, snapshot: &MetricSnapshot) -> TickReport {
        self.ticks += 1;
        self.ctx.metrics.record_tick();
        let mut report = TickReport::default();

        self.evaluate_alerts(snapshot, &mut report).await;

        if self.save_policy.tick() {
            match self.ctx.history.save(&MetricValues::from_snapshot(snapshot)).await {
                Ok(id) => {
                    self.ctx.metrics.inc_history_saves();
                    report.saved = Some(id);
                }
                Err(err) => {
                    self.ctx.metrics.inc_history_failures();
                    report.errors.push(format!("history save failed: {err}"));
                }
            }
        }

        if self.cleanup_every > 0 && (self.ticks - 1) % self.cleanup_every == 0 {
            self.apply_retention(&mut report).await;
        }

        if report.errors.is_empty() {
            self.ctx.metrics.clear_error();
        } else {
            for err in &report.errors {
                warn!("[driver] {err}");
            }
            self.ctx.metrics.record_failure(report.errors.join("; "));
        }
        report
    }

    async fn evaluate_alerts(&mut self, snapshot: &MetricSnapshot, report: &mut TickReport) {
        let sample = MetricSample::from_snapshot(snapshot);
        let evaluation = match self.engine.evaluate(&sample).await {
            Ok(evaluation) => evaluation,
            Err(err) => {
                report.errors.push(format!("alert evaluation failed: {err}"));
                return;
            }
        };

        for err in &evaluation.errors {
            report.errors.push(format!("alert trigger not recorded: {err}"));
        }
        for key in evaluation.recovered.iter().chain(&evaluation.pruned) {
            self.notifier.recovered(key);
        }
        report.recovered = evaluation.recovered.len();
        if evaluation.fired.is_empty() {
            return;
        }

        let prefs = self.notify_prefs(report).await;
        for fired in &evaluation.fired {
            self.ctx.metrics.inc_alerts_fired();
            report.fired += 1;
            match self.notifier.notify(fired, prefs) {
                Delivery::Sent => {
                    self.ctx.metrics.inc_notifications_sent();
                    report.notified += 1;
                }
                Delivery::Disabled | Delivery::RateLimited => {
                    self.ctx.metrics.inc_notifications_suppressed();
                }
            }
        }
    }

    async fn notify_prefs(&self, report: &mut TickReport) -> NotifyPrefs {
        let settings = &self.ctx.settings;
        match (
            settings.notifications_enabled().await,
            settings.sounds_enabled().await,
        ) {
            (Ok(notifications), Ok(sounds)) => NotifyPrefs {
                notifications,
                sounds,
            },
            (Err(err), _) | (_, Err(err)) => {
                report.errors.push(format!("settings unavailable: {err}"));
                NotifyPrefs::default()
            }
        }
    }

    async fn apply_retention(&self, report: &mut TickReport) {
        let retention = match self.ctx.settings.retention().await {
            Ok(retention) => retention,
            Err(err) => {
                report.errors.push(format!("settings unavailable: {err}"));
                return;
            }
        };
        // A zero retention setting means "keep forever" for the periodic
        // sweep; an explicit `history cleanup --days 0` still clears all.
        if retention.is_zero() {
            return;
        }
        match self.ctx.history.cleanup(retention).await {
            Ok(pruned) => {
                self.ctx.metrics.add_history_pruned(pruned);
                report.pruned = pruned;
            }
            Err(err) => report.errors.push(format!("history cleanup failed: {err}")),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
