//! Threshold alerts over analytics snapshots.
//!
//! Rules are evaluated against every snapshot of their pair and timeframe.
//! An undefined statistic never triggers a rule, and each rule stays quiet
//! for `cooldown_ms` of event time after it fires.

use pairs_core::config::{AlertCondition, AlertConfig, AlertRuleConfig};
use pairs_core::{AnalyticsSnapshot, PairId, Timeframe, TimestampMs};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// A compiled alert rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub pair: PairId,
    pub timeframe: Timeframe,
    pub condition: AlertCondition,
    pub threshold: f64,
}

impl From<&AlertRuleConfig> for AlertRule {
    fn from(config: &AlertRuleConfig) -> Self {
        Self {
            id: config.id.clone(),
            pair: config.pair_id(),
            timeframe: config.timeframe,
            condition: config.condition,
            threshold: config.threshold,
        }
    }
}

impl AlertRule {
    /// Snapshot value the rule watches.
    fn observed(&self, snapshot: &AnalyticsSnapshot) -> Option<f64> {
        match self.condition {
            AlertCondition::ZScoreAbove | AlertCondition::ZScoreBelow | AlertCondition::ZScoreAbsAbove => {
                snapshot.z_score
            }
            AlertCondition::SpreadAbove | AlertCondition::SpreadBelow => snapshot.spread,
            AlertCondition::CorrelationBelow => snapshot.correlation,
            AlertCondition::AdfPValueBelow => snapshot.adf_pvalue,
        }
    }

    /// Value that crossed the threshold, if the rule fires on this snapshot.
    pub fn check(&self, snapshot: &AnalyticsSnapshot) -> Option<f64> {
        if snapshot.pair != self.pair || snapshot.timeframe != self.timeframe {
            return None;
        }
        let value = self.observed(snapshot).filter(|v| v.is_finite())?;
        let fired = match self.condition {
            AlertCondition::ZScoreAbove | AlertCondition::SpreadAbove => value > self.threshold,
            AlertCondition::ZScoreAbsAbove => value.abs() > self.threshold,
            AlertCondition::ZScoreBelow
            | AlertCondition::SpreadBelow
            | AlertCondition::CorrelationBelow
            | AlertCondition::AdfPValueBelow => value < self.threshold,
        };
        fired.then_some(value)
    }
}

/// A triggered alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub rule_id: String,
    pub pair: PairId,
    pub timeframe: Timeframe,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub value: f64,
    /// Open time of the bar that fired the rule.
    pub open_time: TimestampMs,
    /// Event time of the snapshot that fired the rule.
    pub triggered_at: TimestampMs,
}

/// Evaluates alert rules with per-rule cooldown.
#[derive(Debug)]
pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    cooldown_ms: i64,
    last_triggered: HashMap<String, TimestampMs>,
    trigger_counts: HashMap<String, u64>,
    history: VecDeque<AlertEvent>,
    history_limit: usize,
}

impl AlertEvaluator {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            rules: config.rules.iter().map(AlertRule::from).collect(),
            cooldown_ms: config.cooldown_ms.max(0),
            last_triggered: HashMap::new(),
            trigger_counts: HashMap::new(),
            history: VecDeque::new(),
            history_limit: config.history_limit,
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Evaluate every rule against a snapshot and record what fired.
    pub fn evaluate(&mut self, snapshot: &AnalyticsSnapshot) -> Vec<AlertEvent> {
        let now = snapshot.computed_at;
        let mut events = Vec::new();

        for rule in &self.rules {
            let Some(value) = rule.check(snapshot) else {
                continue;
            };
            if let Some(&last) = self.last_triggered.get(&rule.id) {
                if now - last < self.cooldown_ms {
                    continue;
                }
            }

            warn!(
                rule = %rule.id,
                pair = %rule.pair,
                timeframe = %rule.timeframe,
                condition = ?rule.condition,
                threshold = rule.threshold,
                value,
                open_time = snapshot.open_time,
                "alert triggered"
            );
            self.last_triggered.insert(rule.id.clone(), now);
            *self.trigger_counts.entry(rule.id.clone()).or_insert(0) += 1;
            events.push(AlertEvent {
                rule_id: rule.id.clone(),
                pair: rule.pair.clone(),
                timeframe: rule.timeframe,
                condition: rule.condition,
                threshold: rule.threshold,
                value,
                open_time: snapshot.open_time,
                triggered_at: now,
            });
        }

        for event in &events {
            if self.history_limit == 0 {
                break;
            }
            if self.history.len() == self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(event.clone());
        }
        events
    }

    /// Triggered alerts, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &AlertEvent> {
        self.history.iter()
    }

    /// How often a rule has fired.
    pub fn trigger_count(&self, rule_id: &str) -> u64 {
        self.trigger_counts.get(rule_id).copied().unwrap_or(0)
    }
}
