use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::sink::Sink;
use super::snapshot::{MetricsSnapshot, Series};
use super::{builtin_definitions, MetricDef, MetricKind, TagSet, ValueType};
use crate::error::ConfigError;

type SeriesKey = (String, TagSet);

/// Shared, append-only store every virtual user writes into.
///
/// Each series has its own lock, so writers to different series never contend.
/// The series map itself is only write-locked the first time a series appears.
pub struct Registry {
    definitions: RwLock<BTreeMap<String, MetricDef>>,
    series: RwLock<HashMap<SeriesKey, Arc<Mutex<Sink>>>>,
    sealed: AtomicBool,
    started: Mutex<Instant>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with the engine's built-in metrics defined.
    pub fn new() -> Self {
        let definitions = builtin_definitions()
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        Self {
            definitions: RwLock::new(definitions),
            series: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            started: Mutex::new(Instant::now()),
        }
    }

    /// Define a custom metric. Redefining with the same kind is a no-op.
    pub fn define(
        &self,
        name: &str,
        kind: MetricKind,
        value_type: ValueType,
    ) -> Result<(), ConfigError> {
        let mut defs = self.definitions.write();
        if let Some(existing) = defs.get(name) {
            if existing.kind != kind {
                return Err(ConfigError::Conflict(format!(
                    "metric {name:?} already defined as {}",
                    existing.kind
                )));
            }
            return Ok(());
        }
        defs.insert(
            name.to_string(),
            MetricDef {
                name: name.to_string(),
                kind,
                value_type,
            },
        );
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<MetricDef> {
        self.definitions.read().get(name).cloned()
    }

    /// Append one sample. Ignored once the registry is sealed.
    pub fn add(&self, name: &str, tags: &TagSet, value: f64) {
        if self.sealed.load(Ordering::Acquire) {
            trace!(metric = name, "sample after seal ignored");
            return;
        }

        let key = (name.to_string(), tags.clone());
        let existing = self.series.read().get(&key).cloned();
        let sink = match existing {
            Some(sink) => sink,
            None => {
                let Some(kind) = self.definitions.read().get(name).map(|d| d.kind) else {
                    warn!(metric = name, "sample for undefined metric dropped");
                    return;
                };
                self.series
                    .write()
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(Sink::new(kind))))
                    .clone()
            }
        };
        sink.lock().add(value);
    }

    /// Restart the clock used for snapshot elapsed time and counter rates.
    pub fn start_clock(&self) {
        *self.started.lock() = Instant::now();
    }

    /// Freeze the registry; later samples are discarded.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Copy every series into an immutable snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let definitions = self.definitions.read().clone();
        let mut series: Vec<Series> = self
            .series
            .read()
            .iter()
            .map(|((name, tags), sink)| Series {
                metric: name.clone(),
                tags: tags.clone(),
                sink: sink.lock().clone(),
            })
            .collect();
        series.sort_by(|a, b| (&a.metric, &a.tags).cmp(&(&b.metric, &b.tags)));
        MetricsSnapshot::new(definitions, series, self.started.lock().elapsed())
    }
}
