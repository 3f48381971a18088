//! Edge-triggered rule evaluation.
//!
//! Each (rule, metric) pair is either NORMAL or ALERTING. Only the
//! NORMAL -> ALERTING edge has side effects: the rule's counter is bumped
//! and a [`FiredAlert`] is returned. ALERTING -> NORMAL is reported as a
//! recovery so the caller can reset its rate limiter. A pair with no
//! remembered state is NORMAL, so a rule that is already breaching on its
//! first evaluation fires.
//!
//! A trigger that cannot be recorded leaves the pair untouched: no event,
//! no state change, so the same edge is retried on the next pass.

use super::{AlertRule, EdgeKey, MetricSample, Operator, RuleStore};
use chrono::Utc;
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct FiredAlert {
    /// The rule as it stands after the trigger was recorded.
    pub rule: AlertRule,
    pub key: EdgeKey,
    pub value: f64,
    pub threshold: f64,
    /// State before this evaluation; always NORMAL (`false`) for a fired alert.
    pub was_alerting: bool,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub fired: Vec<FiredAlert>,
    pub recovered: Vec<EdgeKey>,
    /// Keys whose rule was deleted or disabled since the last pass.
    pub pruned: Vec<EdgeKey>,
    /// Triggers that could not be recorded, one per affected rule.
    pub errors: Vec<sqlx::Error>,
}

/// Remembered state plus the condition it was computed under. When a rule
/// is edited (possibly from another process) the condition no longer
/// matches and the state is discarded.
#[derive(Debug, Clone, Copy)]
struct EdgeState {
    alerting: bool,
    operator: Operator,
    threshold: f64,
}

impl EdgeState {
    fn for_rule(rule: &AlertRule, alerting: bool) -> Self {
        Self {
            alerting,
            operator: rule.operator,
            threshold: rule.threshold,
        }
    }

    fn same_condition(&self, rule: &AlertRule) -> bool {
        self.operator == rule.operator && self.threshold.to_bits() == rule.threshold.to_bits()
    }
}

pub struct AlertEngine {
    rules: RuleStore,
    states: HashMap<EdgeKey, EdgeState>,
}

impl AlertEngine {
    pub fn new(rules: RuleStore) -> Self {
        Self {
            rules,
            states: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Evaluate every enabled rule against `sample`.
    ///
    /// Rules whose metric is missing from the sample are skipped and keep
    /// their state. State for rules that are gone or disabled is dropped.
    /// Only a failure to load the rules is an `Err`; per-rule storage
    /// failures are collected in [`Evaluation::errors`].
    pub async fn evaluate(&mut self, sample: &MetricSample) -> Result<Evaluation, sqlx::Error> {
        let rules = self.rules.list(true).await?;
        let mut evaluation = Evaluation::default();
        self.states.retain(|key, _| {
            let live = rules.iter().any(|rule| rule.key() == *key);
            if !live {
                evaluation.pruned.push(*key);
            }
            live
        });

        for mut rule in rules {
            let Some(value) = sample.get(rule.metric) else {
                continue;
            };
            let key = rule.key();
            let was_alerting = self
                .states
                .get(&key)
                .filter(|state| state.same_condition(&rule))
                .is_some_and(|state| state.alerting);
            let breaching = rule.matches(value);

            match (was_alerting, breaching) {
                (false, true) => {
                    let now = Utc::now();
                    if let Err(err) = self.rules.record_trigger(rule.id, now).await {
                        warn!("[alerts] rule #{} trigger not recorded: {err}", rule.id);
                        evaluation.errors.push(err);
                        continue;
                    }
                    rule.trigger_count += 1;
                    rule.last_triggered = Some(now);
                    debug!("[alerts] rule #{} fired at {value}", rule.id);
                    evaluation.fired.push(FiredAlert {
                        key,
                        value,
                        threshold: rule.threshold,
                        was_alerting,
                        message: rule.describe(value),
                        rule: rule.clone(),
                    });
                }
                (true, false) => {
                    debug!("[alerts] rule #{} recovered at {value}", rule.id);
                    evaluation.recovered.push(key);
                }
                _ => {}
            }
            self.states.insert(key, EdgeState::for_rule(&rule, breaching));
        }
        Ok(evaluation)
    }

    /// Fired alerts only.
    pub async fn evaluate_all(&mut self, sample: &MetricSample) -> Result<Vec<FiredAlert>, sqlx::Error> {
        Ok(self.evaluate(sample).await?.fired)
    }

    /// Forget the state of one rule, e.g. after it was edited locally.
    pub fn reset_rule(&mut self, rule_id: i64) {
        self.states.retain(|key, _| key.rule_id != rule_id);
    }

    pub fn is_alerting(&self, key: &EdgeKey) -> bool {
        self.states.get(key).is_some_and(|state| state.alerting)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Metric, RulePatch, RuleSpec};
    use crate::db::Database;

    async fn engine() -> AlertEngine {
        AlertEngine::new(RuleStore::new(&Database::in_memory().await.unwrap()))
    }

    fn cpu(value: f64) -> MetricSample {
        MetricSample::new().with(Metric::CpuUsage, value)
    }

    #[tokio::test]
    async fn fires_only_on_rising_edges() {
        let mut engine = engine().await;
        let rule = engine
            .rules()
            .create(&RuleSpec::new("cpu", Metric::CpuUsage, Operator::Greater, 80.0))
            .await
            .unwrap();

        let mut fired_at = Vec::new();
        for (i, value) in [70.0, 90.0, 90.0, 70.0, 90.0].into_iter().enumerate() {
            if !engine.evaluate_all(&cpu(value)).await.unwrap().is_empty() {
                fired_at.push(i);
            }
        }
        assert_eq!(fired_at, vec![1, 4]);

        let rule = engine.rules().get(rule.id).await.unwrap().unwrap();
        assert_eq!(rule.trigger_count, 2);
        assert!(rule.last_triggered.is_some());
    }

    #[tokio::test]
    async fn breaching_first_sample_fires() {
        let mut engine = engine().await;
        engine
            .rules()
            .create(&RuleSpec::new("hot", Metric::CpuTemp, Operator::GreaterEq, 85.0))
            .await
            .unwrap();

        let sample = MetricSample::new().with(Metric::CpuTemp, 85.0);
        let fired = engine.evaluate_all(&sample).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert!(!fired[0].was_alerting);
        assert_eq!(fired[0].value, 85.0);
        assert_eq!(fired[0].threshold, 85.0);
        assert_eq!(fired[0].rule.trigger_count, 1);
    }

    #[tokio::test]
    async fn disabled_rules_never_fire() {
        let mut engine = engine().await;
        let mut spec = RuleSpec::new("cpu", Metric::CpuUsage, Operator::Greater, 10.0);
        spec.enabled = false;
        engine.rules().create(&spec).await.unwrap();

        assert!(engine.evaluate_all(&cpu(99.0)).await.unwrap().is_empty());
        assert_eq!(engine.tracked(), 0);
    }

    #[tokio::test]
    async fn missing_metric_skips_rule_and_keeps_state() {
        let mut engine = engine().await;
        let rule = engine
            .rules()
            .create(&RuleSpec::new("gpu", Metric::GpuTemp, Operator::Greater, 80.0))
            .await
            .unwrap();

        let hot = MetricSample::new().with(Metric::GpuTemp, 90.0);
        assert_eq!(engine.evaluate_all(&hot).await.unwrap().len(), 1);
        assert!(engine.evaluate_all(&cpu(50.0)).await.unwrap().is_empty());
        assert!(engine.is_alerting(&rule.key()));
        // Still alerting, so no second edge.
        assert!(engine.evaluate_all(&hot).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_is_reported_without_counting() {
        let mut engine = engine().await;
        let rule = engine
            .rules()
            .create(&RuleSpec::new("ram", Metric::RamUsage, Operator::Greater, 90.0))
            .await
            .unwrap();

        let ram = |v| MetricSample::new().with(Metric::RamUsage, v);
        engine.evaluate(&ram(95.0)).await.unwrap();
        let evaluation = engine.evaluate(&ram(40.0)).await.unwrap();
        assert!(evaluation.fired.is_empty());
        assert_eq!(evaluation.recovered, vec![rule.key()]);

        let rule = engine.rules().get(rule.id).await.unwrap().unwrap();
        assert_eq!(rule.trigger_count, 1);
    }

    #[tokio::test]
    async fn deleted_and_disabled_rules_are_pruned() {
        let mut engine = engine().await;
        let a = engine
            .rules()
            .create(&RuleSpec::new("a", Metric::CpuUsage, Operator::Greater, 1.0))
            .await
            .unwrap();
        let b = engine
            .rules()
            .create(&RuleSpec::new("b", Metric::CpuUsage, Operator::Greater, 2.0))
            .await
            .unwrap();

        engine.evaluate_all(&cpu(50.0)).await.unwrap();
        assert_eq!(engine.tracked(), 2);

        engine.rules().delete(a.id).await.unwrap();
        engine.rules().toggle(b.id).await.unwrap();
        engine.evaluate_all(&cpu(50.0)).await.unwrap();
        assert_eq!(engine.tracked(), 0);

        // Re-enabled while still breaching counts as a new edge.
        engine.rules().toggle(b.id).await.unwrap();
        assert_eq!(engine.evaluate_all(&cpu(50.0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn editing_the_condition_resets_state() {
        let mut engine = engine().await;
        let rule = engine
            .rules()
            .create(&RuleSpec::new("cpu", Metric::CpuUsage, Operator::Greater, 80.0))
            .await
            .unwrap();
        assert_eq!(engine.evaluate_all(&cpu(95.0)).await.unwrap().len(), 1);

        let patch = RulePatch {
            threshold: Some(90.0),
            ..Default::default()
        };
        engine.rules().update(rule.id, &patch).await.unwrap();
        assert_eq!(engine.evaluate_all(&cpu(95.0)).await.unwrap().len(), 1);

        engine.reset_rule(rule.id);
        assert_eq!(engine.tracked(), 0);
    }

    #[tokio::test]
    async fn failed_trigger_keeps_other_edges_and_retries() {
        let db = Database::in_memory().await.unwrap();
        let mut engine = AlertEngine::new(RuleStore::new(&db));
        let a = engine
            .rules()
            .create(&RuleSpec::new("a", Metric::CpuUsage, Operator::Greater, 80.0))
            .await
            .unwrap();
        let b = engine
            .rules()
            .create(&RuleSpec::new("b", Metric::CpuUsage, Operator::Greater, 80.0))
            .await
            .unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER reject_a BEFORE UPDATE OF trigger_count ON alerts \
             WHEN NEW.id = {} BEGIN SELECT RAISE(ABORT, 'read-only'); END",
            a.id
        ))
        .execute(db.pool())
        .await
        .unwrap();

        let evaluation = engine.evaluate(&cpu(95.0)).await.unwrap();
        let fired: Vec<i64> = evaluation.fired.iter().map(|f| f.rule.id).collect();
        assert_eq!(fired, vec![b.id]);
        assert_eq!(evaluation.errors.len(), 1);
        assert!(engine.is_alerting(&b.key()));
        assert!(!engine.is_alerting(&a.key()));

        sqlx::query("DROP TRIGGER reject_a")
            .execute(db.pool())
            .await
            .unwrap();
        let evaluation = engine.evaluate(&cpu(95.0)).await.unwrap();
        let fired: Vec<i64> = evaluation.fired.iter().map(|f| f.rule.id).collect();
        assert_eq!(fired, vec![a.id]);
        assert!(evaluation.errors.is_empty());

        for rule in [a, b] {
            let rule = engine.rules().get(rule.id).await.unwrap().unwrap();
            assert_eq!(rule.trigger_count, 1);
        }
    }

    #[tokio::test]
    async fn pruned_keys_are_reported() {
        let mut engine = engine().await;
        let rule = engine
            .rules()
            .create(&RuleSpec::new("cpu", Metric::CpuUsage, Operator::Greater, 80.0))
            .await
            .unwrap();
        engine.evaluate(&cpu(95.0)).await.unwrap();

        engine.rules().toggle(rule.id).await.unwrap();
        let evaluation = engine.evaluate(&cpu(95.0)).await.unwrap();
        assert_eq!(evaluation.pruned, vec![rule.key()]);
        assert!(engine.evaluate(&cpu(95.0)).await.unwrap().pruned.is_empty());
    }

    #[tokio::test]
    async fn cpu_alto_scenario() {
        let mut engine = engine().await;
        let rule = RuleSpec::parse("CPU Alto", "cpu_usage", ">", "80").unwrap();
        let rule = engine.rules().create(&rule).await.unwrap();

        let mut counts = Vec::new();
        for value in [95.0, 95.0, 50.0, 96.0] {
            let fired = engine.evaluate_all(&cpu(value)).await.unwrap();
            if value == 96.0 {
                assert_eq!(fired.len(), 1);
                assert_eq!(
                    fired[0].message,
                    "CPU Alto: CPU_USAGE above 80% (current 96.0%)"
                );
            }
            counts.push(engine.rules().get(rule.id).await.unwrap().unwrap().trigger_count);
        }
        assert_eq!(counts, vec![1, 1, 1, 2]);
    }
}
