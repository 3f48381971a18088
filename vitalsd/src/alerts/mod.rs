//! Threshold alerts.
//!
//! Rules live in SQLite ([`store::RuleStore`]); the [`engine::AlertEngine`]
//! evaluates them against each tick's [`MetricSample`] and keeps the
//! per-rule edge state; [`notify`] rate-limits and delivers the resulting
//! events.

pub mod engine;
pub mod notify;
pub mod store;

pub use engine::{AlertEngine, Evaluation, FiredAlert};
pub use notify::{
    AlertEvent, AlertFeed, Delivery, LogSink, NotificationSink, Notifier, NotifyPrefs, RateLimiter,
};
pub use store::RuleStore;

use crate::error::RuleError;
use crate::types::MetricSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CpuUsage,
    CpuTemp,
    RamUsage,
    DiskUsage,
    GpuUsage,
    GpuTemp,
    NetUpload,
    NetDownload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    #[serde(rename = "%")]
    Percent,
    #[serde(rename = "°C")]
    Celsius,
    #[serde(rename = "MB/s")]
    MegabytesPerSec,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Percent => "%",
            Unit::Celsius => "°C",
            Unit::MegabytesPerSec => "MB/s",
        }
    }
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::CpuUsage,
        Metric::CpuTemp,
        Metric::RamUsage,
        Metric::DiskUsage,
        Metric::GpuUsage,
        Metric::GpuTemp,
        Metric::NetUpload,
        Metric::NetDownload,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::CpuUsage => "cpu_usage",
            Metric::CpuTemp => "cpu_temp",
            Metric::RamUsage => "ram_usage",
            Metric::DiskUsage => "disk_usage",
            Metric::GpuUsage => "gpu_usage",
            Metric::GpuTemp => "gpu_temp",
            Metric::NetUpload => "net_upload",
            Metric::NetDownload => "net_download",
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            Metric::CpuUsage | Metric::RamUsage | Metric::DiskUsage | Metric::GpuUsage => {
                Unit::Percent
            }
            Metric::CpuTemp | Metric::GpuTemp => Unit::Celsius,
            Metric::NetUpload | Metric::NetDownload => Unit::MegabytesPerSec,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::CpuUsage => "CPU usage",
            Metric::CpuTemp => "CPU temperature",
            Metric::RamUsage => "RAM usage",
            Metric::DiskUsage => "Disk usage",
            Metric::GpuUsage => "GPU usage",
            Metric::GpuTemp => "GPU temperature",
            Metric::NetUpload => "Network upload",
            Metric::NetDownload => "Network download",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|m| m.as_str()).collect()
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| RuleError::UnknownMetric(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">=")]
    GreaterEq,
    #[serde(rename = "<=")]
    LessEq,
    #[serde(rename = "==")]
    Equal,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Greater => ">",
            Operator::Less => "<",
            Operator::GreaterEq => ">=",
            Operator::LessEq => "<=",
            Operator::Equal => "==",
        }
    }

    /// `value OP threshold` as a plain float comparison. `==` is exact.
    #[allow(clippy::float_cmp)]
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Greater => value > threshold,
            Operator::Less => value < threshold,
            Operator::GreaterEq => value >= threshold,
            Operator::LessEq => value <= threshold,
            Operator::Equal => value == threshold,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Operator::Greater => "above",
            Operator::GreaterEq => "at or above",
            Operator::Less => "below",
            Operator::LessEq => "at or below",
            Operator::Equal => "equal to",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Operator::Greater),
            "<" => Ok(Operator::Less),
            ">=" => Ok(Operator::GreaterEq),
            "<=" => Ok(Operator::LessEq),
            "==" => Ok(Operator::Equal),
            other => Err(RuleError::UnknownOperator(other.to_string())),
        }
    }
}

/// One tick's values for the alertable metrics. Missing entries (no GPU,
/// no temperature sensor) make the matching rules sit the tick out.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricSample {
    values: [Option<f64>; 8],
}

impl MetricSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, Some(value));
        self
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        self.values[metric.index()] = value.filter(|v| !v.is_nan());
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values[metric.index()]
    }

    /// Build from loosely named pairs; names that are not a known metric
    /// are ignored.
    pub fn from_named<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<f64>)>,
    {
        let mut sample = Self::new();
        for (name, value) in pairs {
            match name.parse::<Metric>() {
                Ok(metric) => sample.set(metric, value),
                Err(_) => log::debug!("[alerts] ignoring unknown metric '{name}'"),
            }
        }
        sample
    }

    /// Network rates are converted to MB/s to match the rule unit.
    pub fn from_snapshot(snapshot: &MetricSnapshot) -> Self {
        const MIB: f64 = 1024.0 * 1024.0;
        let mut sample = Self::new()
            .with(Metric::CpuUsage, f64::from(snapshot.cpu.usage))
            .with(Metric::RamUsage, f64::from(snapshot.memory.percent))
            .with(Metric::DiskUsage, f64::from(snapshot.disk.usage.percent))
            .with(Metric::NetUpload, snapshot.network.speed.upload / MIB)
            .with(Metric::NetDownload, snapshot.network.speed.download / MIB);
        sample.set(Metric::CpuTemp, snapshot.cpu.temp.map(f64::from));
        if let Some(gpu) = &snapshot.gpu {
            sample.set(Metric::GpuUsage, Some(f64::from(gpu.usage)));
            sample.set(Metric::GpuTemp, Some(f64::from(gpu.temp)));
        }
        sample
    }
}

impl FromIterator<(Metric, f64)> for MetricSample {
    fn from_iter<T: IntoIterator<Item = (Metric, f64)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::new(), |sample, (metric, value)| sample.with(metric, value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    pub metric: Metric,
    pub operator: Operator,
    pub threshold: f64,
    pub enabled: bool,
    pub notify_sound: bool,
    pub trigger_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn matches(&self, value: f64) -> bool {
        self.operator.compare(value, self.threshold)
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            rule_id: self.id,
            metric: self.metric,
        }
    }

    pub fn describe(&self, value: f64) -> String {
        let unit = self.metric.unit().symbol();
        format!(
            "{}: {} {} {}{unit} (current {value:.1}{unit})",
            self.name,
            self.metric.as_str().to_uppercase(),
            self.operator.describe(),
            self.threshold,
        )
    }
}

/// Identity of one edge-state machine and one rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EdgeKey {
    pub rule_id: i64,
    pub metric: Metric,
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert:{}:{}", self.rule_id, self.metric)
    }
}

/// Validated input for a new rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub name: String,
    pub metric: Metric,
    pub operator: Operator,
    pub threshold: f64,
    pub enabled: bool,
    pub notify_sound: bool,
}

impl RuleSpec {
    pub fn new(name: impl Into<String>, metric: Metric, operator: Operator, threshold: f64) -> Self {
        Self {
            name: name.into(),
            metric,
            operator,
            threshold,
            enabled: true,
            notify_sound: true,
        }
    }

    /// Parse user text. Every field is checked; nothing is coerced.
    pub fn parse(name: &str, metric: &str, operator: &str, threshold: &str) -> Result<Self, RuleError> {
        let spec = Self::new(
            name.trim(),
            metric.parse()?,
            operator.parse()?,
            parse_threshold(threshold)?,
        );
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        if !self.threshold.is_finite() {
            return Err(RuleError::InvalidThreshold(self.threshold.to_string()));
        }
        Ok(())
    }
}

pub fn parse_threshold(raw: &str) -> Result<f64, RuleError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RuleError::InvalidThreshold(raw.to_string()))
}

/// Partial update; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub metric: Option<Metric>,
    pub operator: Option<Operator>,
    pub threshold: Option<f64>,
    pub enabled: Option<bool>,
    pub notify_sound: Option<bool>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err(RuleError::EmptyName);
        }
        if let Some(threshold) = self.threshold
            && !threshold.is_finite()
        {
            return Err(RuleError::InvalidThreshold(threshold.to_string()));
        }
        Ok(())
    }

    /// Changing what or how a rule compares invalidates its edge state.
    pub fn changes_condition(&self) -> bool {
        self.metric.is_some() || self.operator.is_some() || self.threshold.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GpuInfo;

    #[test]
    fn operators_compare_literally() {
        assert!(Operator::Greater.compare(80.1, 80.0));
        assert!(!Operator::Greater.compare(80.0, 80.0));
        assert!(Operator::GreaterEq.compare(80.0, 80.0));
        assert!(Operator::Less.compare(-1.0, 0.0));
        assert!(Operator::LessEq.compare(0.0, 0.0));
        assert!(Operator::Equal.compare(50.0, 50.0));
        assert!(!Operator::Equal.compare(0.1 + 0.2, 0.3));
    }

    #[test]
    fn metric_names_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), metric);
        }
        assert!(matches!(
            "cpu".parse::<Metric>(),
            Err(RuleError::UnknownMetric(name)) if name == "cpu"
        ));
    }

    #[test]
    fn rule_parse_rejects_bad_input() {
        assert!(RuleSpec::parse("CPU Alto", "cpu_usage", ">", "80").is_ok());
        assert!(matches!(
            RuleSpec::parse("x", "cpu_usage", ">", "eighty"),
            Err(RuleError::InvalidThreshold(_))
        ));
        assert!(matches!(
            RuleSpec::parse("x", "cpu_usage", ">", "NaN"),
            Err(RuleError::InvalidThreshold(_))
        ));
        assert!(matches!(
            RuleSpec::parse("x", "cpu_usage", "=>", "1"),
            Err(RuleError::UnknownOperator(_))
        ));
        assert!(matches!(
            RuleSpec::parse("x", "swap", ">", "1"),
            Err(RuleError::UnknownMetric(_))
        ));
        assert!(matches!(
            RuleSpec::parse("  ", "cpu_usage", ">", "1"),
            Err(RuleError::EmptyName)
        ));
    }

    #[test]
    fn sample_from_named_skips_unknown_and_null() {
        let sample = MetricSample::from_named([
            ("cpu_usage", Some(42.0)),
            ("cpu_temp", None),
            ("fan_rpm", Some(1200.0)),
        ]);
        assert_eq!(sample.get(Metric::CpuUsage), Some(42.0));
        assert_eq!(sample.get(Metric::CpuTemp), None);
    }

    #[test]
    fn sample_from_snapshot_converts_network_to_mb() {
        let mut snapshot = MetricSnapshot::default();
        snapshot.cpu.usage = 12.5;
        snapshot.network.speed.download = 2.0 * 1024.0 * 1024.0;
        snapshot.gpu = Some(GpuInfo {
            name: "gpu".into(),
            usage: 33.0,
            temp: 70.0,
        });

        let sample = MetricSample::from_snapshot(&snapshot);
        assert_eq!(sample.get(Metric::CpuUsage), Some(12.5));
        assert_eq!(sample.get(Metric::NetDownload), Some(2.0));
        assert_eq!(sample.get(Metric::GpuTemp), Some(70.0));
        assert_eq!(sample.get(Metric::CpuTemp), None);
    }

    #[test]
    fn operator_serializes_as_symbol() {
        assert_eq!(serde_json::to_string(&Operator::GreaterEq).unwrap(), "\">=\"");
        assert_eq!(serde_json::to_string(&Metric::NetUpload).unwrap(), "\"net_upload\"");
    }
}
