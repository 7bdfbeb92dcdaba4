//! Pass/fail expressions over aggregated metrics.
//!
//! A threshold pairs a [`MetricSelector`] with an expression such as
//! `p(95)<500` or `rate<0.01`. Evaluation reads only an immutable
//! [`MetricsSnapshot`] and has no side effects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::duration::parse_duration;
use crate::error::ConfigError;
use crate::metrics::{MetricDef, MetricSelector, MetricsSnapshot, Statistic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => observed < bound,
            Comparator::Le => observed <= bound,
            Comparator::Gt => observed > bound,
            Comparator::Ge => observed >= bound,
            Comparator::Eq => observed == bound,
            Comparator::Ne => observed != bound,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        };
        write!(f, "{s}")
    }
}

/// `<statistic> <comparator> <bound>`, e.g. `p(95) < 250`.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub statistic: Statistic,
    pub comparator: Comparator,
    pub bound: f64,
}

// The earliest match wins; on a tie the longer token wins, so `<=` is not read as `<`.
const OPERATORS: [(&str, Comparator); 8] = [
    ("===", Comparator::Eq),
    ("!==", Comparator::Ne),
    ("<=", Comparator::Le),
    (">=", Comparator::Ge),
    ("==", Comparator::Eq),
    ("!=", Comparator::Ne),
    ("<", Comparator::Lt),
    (">", Comparator::Gt),
];

impl FromStr for Expression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (position, token, comparator) = OPERATORS
            .iter()
            .filter_map(|(token, cmp)| s.find(token).map(|pos| (pos, *token, *cmp)))
            .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
            .ok_or_else(|| "missing comparison operator".to_string())?;

        let statistic: Statistic = s[..position].parse()?;
        let bound_str = s[position + token.len()..].trim();
        let bound: f64 = bound_str
            .parse()
            .map_err(|_| format!("invalid bound {bound_str:?}"))?;
        if !bound.is_finite() {
            return Err(format!("bound {bound_str:?} is not finite"));
        }
        Ok(Self {
            statistic,
            comparator,
            bound,
        })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.statistic, self.comparator, self.bound)
    }
}

/// Threshold entry as written in the plan: a bare expression or a table with abort options.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawThreshold {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default, rename = "abortOnFail")]
        abort_on_fail: bool,
        #[serde(default, rename = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Threshold {
    pub selector: MetricSelector,
    pub source: String,
    pub expression: Expression,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// The metric exists but no matching samples were recorded.
    NoData,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub verdict: Verdict,
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let observed = snapshot.stat(&self.selector, &self.expression.statistic);
        let verdict = match observed {
            None => Verdict::NoData,
            Some(value) if self.expression.comparator.holds(value, self.expression.bound) => {
                Verdict::Pass
            }
            Some(_) => Verdict::Fail,
        };
        ThresholdResult {
            metric: self.selector.to_string(),
            expression: self.source.clone(),
            observed,
            verdict,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

/// All thresholds of a plan, in declaration order per metric.
#[derive(Debug, Clone, Default)]
pub struct Thresholds(Vec<Threshold>);

impl Thresholds {
    pub fn parse(raw: &BTreeMap<String, Vec<RawThreshold>>) -> Result<Self, ConfigError> {
        let mut out = Vec::new();
        for (key, entries) in raw {
            let selector: MetricSelector = key.parse()?;
            for entry in entries {
                let (source, abort_on_fail, delay) = match entry {
                    RawThreshold::Expression(s) => (s.clone(), false, None),
                    RawThreshold::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => (threshold.clone(), *abort_on_fail, delay_abort_eval.as_deref()),
                };
                let expression =
                    source
                        .parse::<Expression>()
                        .map_err(|reason| ConfigError::InvalidThreshold {
                            metric: key.clone(),
                            expression: source.clone(),
                            reason,
                        })?;
                let delay_abort_eval = delay.map(parse_duration).transpose()?.unwrap_or_default();
                out.push(Threshold {
                    selector: selector.clone(),
                    source: source.trim().to_string(),
                    expression,
                    abort_on_fail,
                    delay_abort_eval,
                });
            }
        }
        Ok(Self(out))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_abort_on_fail(&self) -> bool {
        self.0.iter().any(|t| t.abort_on_fail)
    }

    /// Check every threshold against the known metric definitions.
    pub fn validate(&self, lookup: impl Fn(&str) -> Option<MetricDef>) -> Result<(), ConfigError> {
        for threshold in &self.0 {
            let def = lookup(&threshold.selector.name)
                .ok_or_else(|| ConfigError::UnknownMetric(threshold.selector.name.clone()))?;
            if !threshold.expression.statistic.applies_to(def.kind) {
                return Err(ConfigError::StatisticMismatch {
                    metric: def.name,
                    kind: def.kind.to_string(),
                    statistic: threshold.expression.statistic.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<ThresholdResult> {
        self.0.iter().map(|t| t.evaluate(snapshot)).collect()
    }

    /// First abort-on-fail threshold that currently fails, once its delay has passed.
    ///
    /// Missing data never triggers an abort mid-run.
    pub fn first_abort(&self, snapshot: &MetricsSnapshot) -> Option<ThresholdResult> {
        self.0
            .iter()
            .filter(|t| t.abort_on_fail && snapshot.elapsed() >= t.delay_abort_eval)
            .map(|t| t.evaluate(snapshot))
            .find(|r| r.verdict == Verdict::Fail)
    }
}

/// Overall verdict: every threshold must pass.
pub fn all_passed(results: &[ThresholdResult]) -> bool {
    results.iter().all(|r| r.verdict.passed())
}
