use std::collections::BTreeMap;
use std::time::Duration;

use super::sink::{Sink, Statistic};
use super::{MetricDef, MetricSelector, TagSet};

/// One series captured at snapshot time.
#[derive(Debug, Clone)]
pub struct Series {
    pub metric: String,
    pub tags: TagSet,
    pub sink: Sink,
}

/// Immutable view of the registry at one instant.
///
/// Every read is a pure function of the captured data, so evaluating the same
/// selector twice always gives the same answer.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    definitions: BTreeMap<String, MetricDef>,
    series: Vec<Series>,
    elapsed: Duration,
}

impl MetricsSnapshot {
    pub(crate) fn new(
        definitions: BTreeMap<String, MetricDef>,
        series: Vec<Series>,
        elapsed: Duration,
    ) -> Self {
        Self {
            definitions,
            series,
            elapsed,
        }
    }

    /// Time between registry creation and this snapshot.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn definition(&self, name: &str) -> Option<&MetricDef> {
        self.definitions.get(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &MetricDef> {
        self.definitions.values()
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    /// Merge every series of the selected metric whose tags match the filter.
    ///
    /// `None` means no matching samples were ever recorded.
    pub fn aggregate(&self, selector: &MetricSelector) -> Option<Sink> {
        let mut matching = self
            .series
            .iter()
            .filter(|s| s.metric == selector.name && s.tags.contains_all(&selector.tags));
        let first = matching.next()?;
        let mut merged = first.sink.clone();
        for series in matching {
            merged.merge(&series.sink);
        }
        (!merged.is_empty()).then_some(merged)
    }

    pub fn stat(&self, selector: &MetricSelector, statistic: &Statistic) -> Option<f64> {
        self.aggregate(selector)?.stat(statistic, self.elapsed)
    }

    /// Aggregate a metric per distinct value of one tag, e.g. `checks` per `check`.
    pub fn group_by_tag(&self, metric: &str, tag: &str) -> BTreeMap<String, Sink> {
        let mut groups: BTreeMap<String, Sink> = BTreeMap::new();
        for series in self.series.iter().filter(|s| s.metric == metric) {
            let Some(value) = series.tags.get(tag) else {
                continue;
            };
            match groups.get_mut(value) {
                Some(sink) => sink.merge(&series.sink),
                None => {
                    groups.insert(value.to_string(), series.sink.clone());
                }
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::{MetricSelector, Registry, Statistic, TagSet, HTTP_REQ_DURATION};

    #[test]
    fn tag_filtered_selector_only_sees_matching_series() {
        let registry = Registry::new();
        let cpu = TagSet::new().with("name", "test-cpu").with("status", "200");
        let mem = TagSet::new().with("name", "test-memory").with("status", "200");
        for _ in 0..10 {
            registry.add(HTTP_REQ_DURATION, &cpu, 50.0);
            registry.add(HTTP_REQ_DURATION, &mem, 400.0);
        }
        let snapshot = registry.snapshot();

        let all = snapshot
            .stat(&MetricSelector::metric(HTTP_REQ_DURATION), &Statistic::Avg)
            .unwrap();
        assert!((all - 225.0).abs() < 1e-9);

        let only_cpu: MetricSelector = "http_req_duration{name:test-cpu}".parse().unwrap();
        assert_eq!(snapshot.stat(&only_cpu, &Statistic::Max), Some(50.0));

        let nothing: MetricSelector = "http_req_duration{name:healthz}".parse().unwrap();
        assert!(snapshot.aggregate(&nothing).is_none());
    }

    #[test]
    fn grouping_by_tag() {
        let registry = Registry::new();
        registry.add("checks", &TagSet::new().with("check", "status is 200"), 1.0);
        registry.add("checks", &TagSet::new().with("check", "status is 200"), 0.0);
        registry.add("checks", &TagSet::new().with("check", "body ok"), 1.0);
        let groups = registry.snapshot().group_by_tag("checks", "check");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["status is 200"].sample_count(), 2);
        assert_eq!(groups["body ok"].sample_count(), 1);
    }

    #[test]
    fn snapshot_reads_are_repeatable() {
        let registry = Registry::new();
        registry.add(HTTP_REQ_DURATION, &TagSet::new(), 12.0);
        let snapshot = registry.snapshot();
        registry.add(HTTP_REQ_DURATION, &TagSet::new(), 9000.0);
        let selector = MetricSelector::metric(HTTP_REQ_DURATION);
        let first = snapshot.stat(&selector, &Statistic::Max);
        let second = snapshot.stat(&selector, &Statistic::Max);
        assert_eq!(first, Some(12.0));
        assert_eq!(first, second);
    }
}
