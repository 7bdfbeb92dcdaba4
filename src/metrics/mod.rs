//! # Metrics
//!
//! Thread-safe accumulation of samples produced by every virtual user.
//!
//! ## Components
//!
//! - **Registry**: metric definitions plus one sink per (metric, tag set) series
//! - **Sinks**: kind-specific accumulators (counter, gauge, rate, trend)
//! - **Snapshot**: immutable copy of all series used for thresholds and the summary
//!
//! Trend values are milliseconds for time metrics. Trend sinks keep an HDR
//! histogram, so memory stays bounded no matter how long the run is.

pub mod registry;
pub mod sink;
pub mod snapshot;

pub use registry::Registry;
pub use sink::{Sink, Statistic};
pub use snapshot::MetricsSnapshot;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const DATA_RECEIVED: &str = "data_received";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

/// Kind of aggregation applied to a metric's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Cumulative sum of sample values.
    Counter,
    /// Last observed value plus its min/max.
    Gauge,
    /// Fraction of non-zero samples.
    Rate,
    /// Distribution of values (percentiles, average, extremes).
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Rate => write!(f, "rate"),
            MetricKind::Trend => write!(f, "trend"),
        }
    }
}

/// Unit of a metric's values, used only for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Default,
    /// Milliseconds.
    Time,
    /// Bytes.
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDef {
    pub name: String,
    pub kind: MetricKind,
    pub value_type: ValueType,
}

/// Built-in metrics recorded by the engine itself.
pub fn builtin_definitions() -> Vec<MetricDef> {
    let def = |name: &str, kind, value_type| MetricDef {
        name: name.to_string(),
        kind,
        value_type,
    };
    vec![
        def(HTTP_REQS, MetricKind::Counter, ValueType::Default),
        def(HTTP_REQ_DURATION, MetricKind::Trend, ValueType::Time),
        def(HTTP_REQ_FAILED, MetricKind::Rate, ValueType::Default),
        def(DATA_RECEIVED, MetricKind::Counter, ValueType::Data),
        def(CHECKS, MetricKind::Rate, ValueType::Default),
        def(ITERATIONS, MetricKind::Counter, ValueType::Default),
        def(ITERATION_DURATION, MetricKind::Trend, ValueType::Time),
        def(VUS, MetricKind::Gauge, ValueType::Default),
        def(VUS_MAX, MetricKind::Gauge, ValueType::Default),
    ]
}

/// Ordered tag set attached to a series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every tag in `filter` is present here with the same value.
    pub fn contains_all(&self, filter: &TagSet) -> bool {
        filter
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|own| own == v))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// A metric name with an optional tag filter, e.g. `http_req_duration{name:test-cpu}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricSelector {
    pub name: String,
    pub tags: TagSet,
}

impl MetricSelector {
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: TagSet::new(),
        }
    }
}

impl FromStr for MetricSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSelector(s.to_string());
        let s = s.trim();
        let (name, filter) = match s.find('{') {
            Some(open) => {
                let inner = s[open + 1..].strip_suffix('}').ok_or_else(invalid)?;
                (&s[..open], Some(inner))
            }
            None => (s, None),
        };
        let name = name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(invalid());
        }

        let mut tags = TagSet::new();
        if let Some(inner) = filter {
            for pair in inner.split(',').filter(|p| !p.trim().is_empty()) {
                let (k, v) = pair.split_once(':').ok_or_else(invalid)?;
                let (k, v) = (k.trim(), v.trim());
                if k.is_empty() {
                    return Err(invalid());
                }
                tags.insert(k, v);
            }
            if tags.is_empty() {
                return Err(invalid());
            }
        }

        Ok(Self {
            name: name.to_string(),
            tags,
        })
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{{{}}}", self.name, self.tags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_without_tags() {
        let sel: MetricSelector = "http_req_failed".parse().unwrap();
        assert_eq!(sel.name, "http_req_failed");
        assert!(sel.tags.is_empty());
        assert_eq!(sel.to_string(), "http_req_failed");
    }

    #[test]
    fn selector_with_tags() {
        let sel: MetricSelector = "http_req_duration{name: test-cpu, method:GET}"
            .parse()
            .unwrap();
        assert_eq!(sel.name, "http_req_duration");
        assert_eq!(sel.tags.get("name"), Some("test-cpu"));
        assert_eq!(sel.tags.get("method"), Some("GET"));
        assert_eq!(sel.to_string(), "http_req_duration{method:GET,name:test-cpu}");
    }

    #[test]
    fn selector_rejects_garbage() {
        for bad in ["", "{a:b}", "metric{", "metric{}", "metric{novalue}", "bad name"] {
            assert!(bad.parse::<MetricSelector>().is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn tag_filter_matching() {
        let series = TagSet::new().with("name", "a").with("status", "200");
        assert!(series.contains_all(&TagSet::new()));
        assert!(series.contains_all(&TagSet::new().with("name", "a")));
        assert!(!series.contains_all(&TagSet::new().with("name", "b")));
        assert!(!series.contains_all(&TagSet::new().with("method", "GET")));
    }
}
