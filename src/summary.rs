//! End-of-test report: verdict, exit code, text summary and JSON export.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::metrics::{
    MetricKind, MetricSelector, MetricsSnapshot, Sink, Statistic, ValueType, CHECKS,
};
use crate::pool::ScenarioCounts;
use crate::thresholds::{all_passed, ThresholdResult, Verdict};

pub const EXIT_OK: u8 = 0;
pub const EXIT_THRESHOLDS_FAILED: u8 = 99;
pub const EXIT_INVALID_CONFIG: u8 = 104;
pub const EXIT_INTERRUPTED: u8 = 105;

/// Why a run ended before its scenarios finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// An `abortOnFail` threshold failed mid-run.
    Threshold { metric: String, expression: String },
    /// Stopped by a signal or an external cancellation.
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub name: String,
    pub kind: MetricKind,
    pub value_type: ValueType,
    /// Statistic name (`avg`, `p(95)`, `rate`, ...) to value.
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub executor: String,
    #[serde(flatten)]
    pub counts: ScenarioCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub duration_secs: f64,
    pub aborted: Option<AbortReason>,
    pub thresholds: Vec<ThresholdResult>,
    pub checks: Vec<CheckSummary>,
    pub metrics: Vec<MetricSummary>,
    pub scenarios: Vec<ScenarioSummary>,
    #[serde(skip)]
    snapshot: MetricsSnapshot,
}

impl RunReport {
    pub fn build(
        snapshot: MetricsSnapshot,
        thresholds: Vec<ThresholdResult>,
        trend_stats: &[Statistic],
        scenarios: Vec<ScenarioSummary>,
        aborted: Option<AbortReason>,
    ) -> Self {
        let metrics = snapshot
            .definitions()
            .filter_map(|def| {
                let sink = snapshot.aggregate(&MetricSelector::metric(def.name.as_str()))?;
                Some(MetricSummary {
                    name: def.name.clone(),
                    kind: def.kind,
                    value_type: def.value_type,
                    values: summarize(&sink, trend_stats, snapshot.elapsed()),
                })
            })
            .collect();

        let checks = snapshot
            .group_by_tag(CHECKS, "check")
            .into_iter()
            .filter_map(|(name, sink)| match sink {
                Sink::Rate(r) => Some(CheckSummary {
                    name,
                    passes: r.trues,
                    fails: r.total - r.trues,
                }),
                _ => None,
            })
            .collect();

        Self {
            duration_secs: snapshot.elapsed().as_secs_f64(),
            aborted,
            thresholds,
            checks,
            metrics,
            scenarios,
            snapshot,
        }
    }

    /// Final metrics the report was built from.
    pub fn snapshot(&self) -> &MetricsSnapshot {
        &self.snapshot
    }

    /// True when the run was not aborted and every threshold passed.
    pub fn passed(&self) -> bool {
        self.aborted.is_none() && all_passed(&self.thresholds)
    }

    pub fn exit_code(&self) -> u8 {
        match (&self.aborted, self.passed()) {
            (Some(AbortReason::Interrupted), _) => EXIT_INTERRUPTED,
            (_, true) => EXIT_OK,
            (_, false) => EXIT_THRESHOLDS_FAILED,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub async fn export_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = self.to_json()?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

fn summarize(sink: &Sink, trend_stats: &[Statistic], elapsed: Duration) -> BTreeMap<String, f64> {
    let stats: Vec<Statistic> = match sink.kind() {
        MetricKind::Trend => trend_stats.to_vec(),
        MetricKind::Counter => vec![Statistic::Count, Statistic::Rate],
        MetricKind::Rate => vec![Statistic::Rate],
        MetricKind::Gauge => vec![Statistic::Value, Statistic::Min, Statistic::Max],
    };
    let mut values: BTreeMap<String, f64> = stats
        .iter()
        .filter_map(|s| Some((s.to_string(), sink.stat(s, elapsed)?)))
        .collect();
    if let Sink::Rate(r) = sink {
        values.insert("passes".into(), r.trues as f64);
        values.insert("fails".into(), (r.total - r.trues) as f64);
    }
    values
}

fn format_value(value: f64, value_type: ValueType) -> String {
    match value_type {
        ValueType::Time if value >= 60_000.0 => format!("{:.2}m", value / 60_000.0),
        ValueType::Time if value >= 1000.0 => format!("{:.2}s", value / 1000.0),
        ValueType::Time if value >= 1.0 => format!("{value:.2}ms"),
        ValueType::Time => format!("{:.2}µs", value * 1000.0),
        ValueType::Data if value >= 1_000_000.0 => format!("{:.1} MB", value / 1_000_000.0),
        ValueType::Data if value >= 1000.0 => format!("{:.1} kB", value / 1000.0),
        ValueType::Data => format!("{value} B"),
        ValueType::Default if value.fract() == 0.0 => format!("{value}"),
        ValueType::Default => format!("{value:.4}"),
    }
}

fn format_percent(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}

fn dotted(name: &str, width: usize) -> String {
    let dots = width.saturating_sub(name.chars().count());
    format!("{name}{}", ".".repeat(dots))
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (&self.aborted, self.passed()) {
            (Some(AbortReason::Interrupted), _) => "INTERRUPTED",
            (Some(AbortReason::Threshold { .. }), _) => "ABORTED",
            (None, true) => "PASSED",
            (None, false) => "FAILED",
        };
        writeln!(f)?;
        writeln!(f, "  run {status} after {:.1}s", self.duration_secs)?;
        if let Some(AbortReason::Threshold { metric, expression }) = &self.aborted {
            writeln!(f, "  aborted by threshold {metric}: {expression}")?;
        }

        if !self.scenarios.is_empty() {
            writeln!(f)?;
            writeln!(f, "  scenarios")?;
            for s in &self.scenarios {
                writeln!(
                    f,
                    "    {} ({}): peak {} VUs, {} iterations complete, {} interrupted",
                    s.name,
                    s.executor,
                    s.counts.peak_vus,
                    s.counts.iterations_completed,
                    s.counts.iterations_interrupted
                )?;
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f)?;
            writeln!(f, "  thresholds")?;
            for t in &self.thresholds {
                let mark = if t.verdict.passed() { "✓" } else { "✗" };
                let observed = match (t.verdict, t.observed) {
                    (Verdict::NoData, _) | (_, None) => "no data".to_string(),
                    (_, Some(v)) => {
                        let value_type = self
                            .metric(metric_name(&t.metric))
                            .map_or(ValueType::Default, |m| m.value_type);
                        format_value(v, value_type)
                    }
                };
                writeln!(f, "    {mark} {} {} (observed {observed})", t.metric, t.expression)?;
            }
        }

        if !self.checks.is_empty() {
            writeln!(f)?;
            writeln!(f, "  checks")?;
            for c in &self.checks {
                let total = c.passes + c.fails;
                let mark = if c.fails == 0 { "✓" } else { "✗" };
                let pct = if total > 0 { c.passes as f64 / total as f64 } else { 0.0 };
                writeln!(
                    f,
                    "    {mark} {} {} ✓ {} ✗ {}",
                    c.name,
                    format_percent(pct),
                    c.passes,
                    c.fails
                )?;
            }
        }

        writeln!(f)?;
        let width = self.metrics.iter().map(|m| m.name.len()).max().unwrap_or(0) + 3;
        for m in &self.metrics {
            let rendered: Vec<String> = match m.kind {
                MetricKind::Rate => {
                    let rate = m.values.get("rate").copied().unwrap_or(0.0);
                    vec![
                        format_percent(rate),
                        format!("✓ {}", m.values.get("passes").copied().unwrap_or(0.0)),
                        format!("✗ {}", m.values.get("fails").copied().unwrap_or(0.0)),
                    ]
                }
                MetricKind::Counter => {
                    let count = m.values.get("count").copied().unwrap_or(0.0);
                    let rate = m.values.get("rate").copied().unwrap_or(0.0);
                    vec![
                        format_value(count, m.value_type),
                        format!("{}/s", format_value(rate, m.value_type)),
                    ]
                }
                MetricKind::Gauge | MetricKind::Trend => m
                    .values
                    .iter()
                    .map(|(stat, v)| format!("{stat}={}", format_value(*v, m.value_type)))
                    .collect(),
            };
            writeln!(f, "  {}: {}", dotted(&m.name, width), rendered.join(" "))?;
        }
        Ok(())
    }
}

/// Metric name of a selector string such as `http_req_duration{name:x}`.
fn metric_name(selector: &str) -> &str {
    selector.split('{').next().unwrap_or(selector)
}
