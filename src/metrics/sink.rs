use hdrhistogram::Histogram;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::MetricKind;

/// Highest trend value the histogram tracks, in microseconds (one hour).
/// Larger samples are clamped into the top bucket; exact min/max still see them.
const TREND_MAX_MICROS: u64 = 3_600_000_000;
const TREND_SIGNIFICANT_DIGITS: u8 = 3;

/// An aggregate that can be read from a sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `0.0..=100.0`.
    Percentile(f64),
    Count,
    Rate,
    Value,
}

impl Statistic {
    /// Whether this statistic can be computed for a metric of `kind`.
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => matches!(
                self,
                Statistic::Avg
                    | Statistic::Min
                    | Statistic::Max
                    | Statistic::Med
                    | Statistic::Percentile(_)
                    | Statistic::Count
            ),
            MetricKind::Counter => matches!(self, Statistic::Count | Statistic::Rate),
            MetricKind::Rate => matches!(self, Statistic::Rate),
            MetricKind::Gauge => matches!(self, Statistic::Value | Statistic::Min | Statistic::Max),
        }
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "avg" => return Ok(Statistic::Avg),
            "min" => return Ok(Statistic::Min),
            "max" => return Ok(Statistic::Max),
            "med" => return Ok(Statistic::Med),
            "count" => return Ok(Statistic::Count),
            "rate" => return Ok(Statistic::Rate),
            "value" => return Ok(Statistic::Value),
            _ => {}
        }
        let inner = s
            .strip_prefix("p(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| format!("unknown statistic {s:?}"))?;
        let p: f64 = inner
            .trim()
            .parse()
            .map_err(|_| format!("invalid percentile {inner:?}"))?;
        if !(0.0..=100.0).contains(&p) {
            return Err(format!("percentile {p} outside 0..=100"));
        }
        Ok(Statistic::Percentile(p))
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Avg => write!(f, "avg"),
            Statistic::Min => write!(f, "min"),
            Statistic::Max => write!(f, "max"),
            Statistic::Med => write!(f, "med"),
            Statistic::Percentile(p) => write!(f, "p({p})"),
            Statistic::Count => write!(f, "count"),
            Statistic::Rate => write!(f, "rate"),
            Statistic::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CounterSink {
    pub sum: f64,
    pub samples: u64,
}

#[derive(Debug, Clone)]
pub struct GaugeSink {
    pub last: f64,
    pub min: f64,
    pub max: f64,
    pub samples: u64,
}

impl Default for GaugeSink {
    fn default() -> Self {
        Self {
            last: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            samples: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateSink {
    pub trues: u64,
    pub total: u64,
}

impl RateSink {
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.trues as f64 / self.total as f64)
    }
}

#[derive(Debug, Clone)]
pub struct TrendSink {
    histogram: Histogram<u64>,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl Default for TrendSink {
    fn default() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, TREND_MAX_MICROS, TREND_SIGNIFICANT_DIGITS)
                .expect("constant histogram bounds are valid"),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }
}

impl TrendSink {
    fn add(&mut self, value: f64) {
        let value = value.max(0.0);
        self.histogram
            .saturating_record((value * 1000.0).round() as u64);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    /// Percentile in milliseconds, clamped to the exact observed extremes.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let micros = self.histogram.value_at_quantile(p / 100.0);
        Some((micros as f64 / 1000.0).clamp(self.min, self.max))
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn merge(&mut self, other: &TrendSink) {
        // Same bounds on both sides and saturating records, so this cannot overflow.
        let _ = self.histogram.add(&other.histogram);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// Kind-specific accumulator for one series.
#[derive(Debug, Clone)]
pub enum Sink {
    Counter(CounterSink),
    Gauge(GaugeSink),
    Rate(RateSink),
    Trend(TrendSink),
}

impl Sink {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Sink::Counter(CounterSink::default()),
            MetricKind::Gauge => Sink::Gauge(GaugeSink::default()),
            MetricKind::Rate => Sink::Rate(RateSink::default()),
            MetricKind::Trend => Sink::Trend(TrendSink::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Sink::Counter(_) => MetricKind::Counter,
            Sink::Gauge(_) => MetricKind::Gauge,
            Sink::Rate(_) => MetricKind::Rate,
            Sink::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn add(&mut self, value: f64) {
        match self {
            Sink::Counter(c) => {
                c.sum += value;
                c.samples += 1;
            }
            Sink::Gauge(g) => {
                g.last = value;
                g.min = g.min.min(value);
                g.max = g.max.max(value);
                g.samples += 1;
            }
            Sink::Rate(r) => {
                if value != 0.0 {
                    r.trues += 1;
                }
                r.total += 1;
            }
            Sink::Trend(t) => t.add(value),
        }
    }

    /// Fold another series of the same kind into this one.
    ///
    /// Gauges keep the other side's last value, so callers merge in series order.
    pub fn merge(&mut self, other: &Sink) {
        match (self, other) {
            (Sink::Counter(a), Sink::Counter(b)) => {
                a.sum += b.sum;
                a.samples += b.samples;
            }
            (Sink::Gauge(a), Sink::Gauge(b)) => {
                if b.samples > 0 {
                    a.last = b.last;
                }
                a.min = a.min.min(b.min);
                a.max = a.max.max(b.max);
                a.samples += b.samples;
            }
            (Sink::Rate(a), Sink::Rate(b)) => {
                a.trues += b.trues;
                a.total += b.total;
            }
            (Sink::Trend(a), Sink::Trend(b)) => a.merge(b),
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    pub fn sample_count(&self) -> u64 {
        match self {
            Sink::Counter(c) => c.samples,
            Sink::Gauge(g) => g.samples,
            Sink::Rate(r) => r.total,
            Sink::Trend(t) => t.count,
        }
    }

    /// Read a statistic; `elapsed` is the run time used for per-second counter rates.
    ///
    /// Returns `None` when the sink is empty or the statistic does not apply.
    pub fn stat(&self, statistic: &Statistic, elapsed: Duration) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        match (self, statistic) {
            (Sink::Counter(c), Statistic::Count) => Some(c.sum),
            (Sink::Counter(c), Statistic::Rate) => {
                let secs = elapsed.as_secs_f64();
                Some(if secs > 0.0 { c.sum / secs } else { 0.0 })
            }
            (Sink::Gauge(g), Statistic::Value) => Some(g.last),
            (Sink::Gauge(g), Statistic::Min) => Some(g.min),
            (Sink::Gauge(g), Statistic::Max) => Some(g.max),
            (Sink::Rate(r), Statistic::Rate) => r.rate(),
            (Sink::Trend(t), Statistic::Avg) => t.avg(),
            (Sink::Trend(t), Statistic::Min) => Some(t.min),
            (Sink::Trend(t), Statistic::Max) => Some(t.max),
            (Sink::Trend(t), Statistic::Med) => t.percentile(50.0),
            (Sink::Trend(t), Statistic::Percentile(p)) => t.percentile(*p),
            (Sink::Trend(t), Statistic::Count) => Some(t.count as f64),
            _ => None,
        }
    }
}
