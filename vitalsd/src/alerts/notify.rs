//! Alert delivery: per-key rate limiting, user preferences and fan-out to
//! pluggable sinks. Delivery is spawned and never blocks the driver.

use super::{EdgeKey, FiredAlert, Metric};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
pub const FEED_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub rule_id: i64,
    pub rule_name: String,
    pub metric: Metric,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub play_sound: bool,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(fired: &FiredAlert, sounds_enabled: bool) -> Self {
        Self {
            rule_id: fired.rule.id,
            rule_name: fired.rule.name.clone(),
            metric: fired.rule.metric,
            value: fired.value,
            threshold: fired.threshold,
            message: fired.message.clone(),
            play_sound: fired.rule.notify_sound && sounds_enabled,
            timestamp: fired.rule.last_triggered.unwrap_or_else(Utc::now),
        }
    }
}

/// Something that can put an alert in front of a human.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

/// Writes alerts to the `vitals_alerts` log target.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
        warn!(
            target: "vitals_alerts",
            "rule_id={} metric={} value={:.2} threshold={} sound={} {}",
            event.rule_id,
            event.metric,
            event.value,
            event.threshold,
            event.play_sound,
            event.message
        );
        Ok(())
    }
}

/// At most one delivery per key per cooldown window. Independent of edge
/// detection: a key that keeps re-firing inside the window is held back.
pub struct RateLimiter {
    cooldown: Duration,
    last_sent: Mutex<HashMap<EdgeKey, Instant>>,
}

impl RateLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Records `now` when allowed.
    pub fn allow(&self, key: EdgeKey, now: Instant) -> bool {
        let mut last_sent = lock(&self.last_sent);
        match last_sent.get(&key) {
            Some(at) if now.saturating_duration_since(*at) < self.cooldown => false,
            _ => {
                last_sent.insert(key, now);
                true
            }
        }
    }

    pub fn reset(&self, key: &EdgeKey) {
        lock(&self.last_sent).remove(key);
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

/// Bounded in-memory history of delivered alerts, newest last.
pub struct AlertFeed {
    inner: Mutex<VecDeque<AlertEvent>>,
    capacity: usize,
}

impl AlertFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, event: AlertEvent) {
        let mut inner = lock(&self.inner);
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(event);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        lock(&self.inner).iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertFeed {
    fn default() -> Self {
        Self::new(FEED_CAPACITY)
    }
}

/// User preferences read from the settings table each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyPrefs {
    pub notifications: bool,
    pub sounds: bool,
}

impl Default for NotifyPrefs {
    fn default() -> Self {
        Self {
            notifications: true,
            sounds: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Disabled,
    RateLimited,
}

pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
    limiter: RateLimiter,
    feed: Arc<AlertFeed>,
}

impl Notifier {
    pub fn new(cooldown: Duration, feed: Arc<AlertFeed>) -> Self {
        Self {
            sinks: Vec::new(),
            limiter: RateLimiter::new(cooldown),
            feed,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn feed(&self) -> &Arc<AlertFeed> {
        &self.feed
    }

    /// Gate a fired alert through preferences and the rate limiter, then
    /// hand it to every sink on its own task.
    pub fn notify(&self, fired: &FiredAlert, prefs: NotifyPrefs) -> Delivery {
        if !prefs.notifications {
            return Delivery::Disabled;
        }
        if !self.limiter.allow(fired.key, Instant::now()) {
            info!("[alerts] {} rate limited", fired.key);
            return Delivery::RateLimited;
        }

        let event = AlertEvent::new(fired, prefs.sounds);
        self.feed.record(event.clone());
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = sink.deliver(&event).await {
                    warn!("[alerts] sink '{}' failed: {err:#}", sink.name());
                }
            });
        }
        Delivery::Sent
    }

    /// A key returned to NORMAL; its next edge may notify immediately.
    pub fn recovered(&self, key: &EdgeKey) {
        self.limiter.reset(key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRule, Operator};
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<AlertEvent>);

    #[async_trait]
    impl NotificationSink for ChannelSink {
        fn name(&self) -> &str {
            "channel"
        }

        async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
            self.0.send(event.clone())?;
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _event: &AlertEvent) -> anyhow::Result<()> {
            anyhow::bail!("unreachable desktop bus")
        }
    }

    fn fired(rule_id: i64, notify_sound: bool) -> FiredAlert {
        let rule = AlertRule {
            id: rule_id,
            name: "CPU Alto".into(),
            metric: Metric::CpuUsage,
            operator: Operator::Greater,
            threshold: 80.0,
            enabled: true,
            notify_sound,
            trigger_count: 1,
            last_triggered: Some(Utc::now()),
            created_at: Utc::now(),
        };
        FiredAlert {
            key: rule.key(),
            value: 95.0,
            threshold: 80.0,
            was_alerting: false,
            message: rule.describe(95.0),
            rule,
        }
    }

    #[test]
    fn limiter_holds_back_within_cooldown() {
        let limiter = RateLimiter::new(Duration::from_secs(30));
        let key = fired(1, true).key;
        let t0 = Instant::now();

        assert!(limiter.allow(key, t0));
        assert!(!limiter.allow(key, t0 + Duration::from_secs(29)));
        assert!(limiter.allow(key, t0 + Duration::from_secs(30)));

        let other = fired(2, true).key;
        assert!(limiter.allow(other, t0));
    }

    #[test]
    fn reset_reopens_the_window() {
        let limiter = RateLimiter::default();
        let key = fired(1, true).key;
        let t0 = Instant::now();
        assert!(limiter.allow(key, t0));
        limiter.reset(&key);
        assert!(limiter.allow(key, t0 + Duration::from_millis(1)));
    }

    #[test]
    fn feed_is_bounded_and_newest_first() {
        let feed = AlertFeed::new(2);
        for id in 1..=3 {
            feed.record(AlertEvent::new(&fired(id, true), true));
        }
        let recent = feed.recent(10);
        assert_eq!(recent.iter().map(|e| e.rule_id).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(feed.recent(0).len(), 0);
    }

    #[test]
    fn sound_needs_rule_and_preference() {
        assert!(AlertEvent::new(&fired(1, true), true).play_sound);
        assert!(!AlertEvent::new(&fired(1, true), false).play_sound);
        assert!(!AlertEvent::new(&fired(1, false), true).play_sound);
    }

    #[tokio::test]
    async fn delivers_to_sinks_once_per_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = Arc::new(AlertFeed::default());
        let notifier = Notifier::new(Duration::from_secs(60), feed.clone())
            .with_sink(Arc::new(FailingSink))
            .with_sink(Arc::new(ChannelSink(tx)));

        let alert = fired(7, true);
        assert_eq!(notifier.notify(&alert, NotifyPrefs::default()), Delivery::Sent);
        assert_eq!(
            notifier.notify(&alert, NotifyPrefs::default()),
            Delivery::RateLimited
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.rule_id, 7);
        assert_eq!(event.message, "CPU Alto: CPU_USAGE above 80% (current 95.0%)");
        assert_eq!(feed.len(), 1);

        notifier.recovered(&alert.key);
        assert_eq!(notifier.notify(&alert, NotifyPrefs::default()), Delivery::Sent);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn disabled_notifications_are_suppressed() {
        let feed = Arc::new(AlertFeed::default());
        let notifier = Notifier::new(DEFAULT_COOLDOWN, feed.clone()).with_sink(Arc::new(LogSink));
        let prefs = NotifyPrefs {
            notifications: false,
            sounds: true,
        };
        assert_eq!(notifier.notify(&fired(1, true), prefs), Delivery::Disabled);
        assert!(feed.is_empty());
    }
}
