use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use vitalsd::alerts::{AlertEvent, Metric, NotificationSink, Operator, RuleSpec};
use vitalsd::config::Config;
use vitalsd::context::Context;
use vitalsd::db::Database;
use vitalsd::driver::Driver;
use vitalsd::settings::ENABLE_SOUNDS;
use vitalsd::types::{GpuInfo, MetricSnapshot};

struct Recorder(mpsc::UnboundedSender<AlertEvent>);

#[async_trait]
impl NotificationSink for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
        self.0.send(event.clone())?;
        Ok(())
    }
}

async fn setup(cooldown_secs: u64) -> (Driver, Context, mpsc::UnboundedReceiver<AlertEvent>) {
    let mut config = Config::default();
    config.alerts.cooldown_secs = cooldown_secs;
    config.sampler.history_every_ticks = 0;
    let ctx = Context::with_database(config, Database::in_memory().await.unwrap())
        .await
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = Driver::new(ctx.clone()).with_sink(Arc::new(Recorder(tx)));
    (driver, ctx, rx)
}

fn gpu_snapshot(temp: f32) -> MetricSnapshot {
    MetricSnapshot {
        gpu: Some(GpuInfo {
            name: "test gpu".into(),
            usage: 50.0,
            temp,
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn gpu_temperature_alert_reaches_sink() {
    let (mut driver, ctx, mut rx) = setup(30).await;
    ctx.settings.set(ENABLE_SOUNDS, "false").await.unwrap();
    ctx.rules
        .create(&RuleSpec::new("GPU hot", Metric::GpuTemp, Operator::GreaterEq, 85.0))
        .await
        .unwrap();

    driver.process(&gpu_snapshot(70.0)).await;
    driver.process(&gpu_snapshot(88.0)).await;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.rule_name, "GPU hot");
    assert_eq!(event.metric, Metric::GpuTemp);
    assert_eq!(event.value, 88.0);
    assert!(!event.play_sound);
    assert_eq!(ctx.feed.recent(10), vec![event]);
}

#[tokio::test]
async fn missing_gpu_never_fires() {
    let (mut driver, ctx, mut rx) = setup(30).await;
    ctx.rules
        .create(&RuleSpec::new("GPU hot", Metric::GpuTemp, Operator::Greater, 0.0))
        .await
        .unwrap();

    let report = driver.process(&MetricSnapshot::default()).await;
    assert_eq!(report.fired, 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn flapping_rule_is_rate_limited_only_while_alerting() {
    let (mut driver, ctx, mut rx) = setup(3_600).await;
    let rule = ctx
        .rules
        .create(&RuleSpec::new("GPU hot", Metric::GpuTemp, Operator::Greater, 80.0))
        .await
        .unwrap();

    for temp in [90.0, 70.0, 90.0, 70.0, 90.0] {
        driver.process(&gpu_snapshot(temp)).await;
    }

    // Each recovery resets the limiter, so every rising edge is delivered.
    let mut delivered = 0;
    while tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
        .is_some()
    {
        delivered += 1;
    }
    assert_eq!(delivered, 3);
    let rule = ctx.rules.get(rule.id).await.unwrap().unwrap();
    assert_eq!(rule.trigger_count, 3);
}
