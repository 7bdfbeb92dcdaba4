//! Test options as written in a plan file, and their validated form.
//!
//! Field names follow the k6 option names (`stages`, `scenarios`,
//! `gracefulStop`, `startVUs`, ...) so existing scenario definitions carry
//! over unchanged. [`RawOptions::into_plan`] turns them into an immutable
//! [`TestPlan`]; every error surfaces there, before any VU is started.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::duration::{parse_duration, Human};
use crate::error::ConfigError;
use crate::metrics::{MetricKind, Statistic};
use crate::thresholds::{RawThreshold, Thresholds};

pub const DEFAULT_SCENARIO: &str = "default";
pub const DEFAULT_EXEC: &str = "default";
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TREND_STATS: [&str; 6] = ["avg", "min", "med", "max", "p(90)", "p(95)"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStage {
    pub duration: String,
    pub target: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawScenario {
    pub executor: String,
    pub vus: Option<i64>,
    pub duration: Option<String>,
    #[serde(rename = "startVUs")]
    pub start_vus: Option<i64>,
    pub stages: Option<Vec<RawStage>>,
    #[serde(rename = "gracefulStop")]
    pub graceful_stop: Option<String>,
    #[serde(rename = "gracefulRampDown")]
    pub graceful_ramp_down: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: Option<String>,
    pub exec: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOptions {
    pub stages: Option<Vec<RawStage>>,
    pub vus: Option<i64>,
    pub duration: Option<String>,
    #[serde(default)]
    pub scenarios: BTreeMap<String, RawScenario>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<RawThreshold>>,
    #[serde(default, rename = "noConnectionReuse")]
    pub no_connection_reuse: bool,
    #[serde(rename = "userAgent")]
    pub user_agent: Option<String>,
    #[serde(rename = "httpTimeout")]
    pub http_timeout: Option<String>,
    #[serde(rename = "summaryTrendStats")]
    pub summary_trend_stats: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executor {
    RampingVus {
        start_vus: u32,
        stages: Vec<Stage>,
        graceful_ramp_down: Duration,
    },
    ConstantVus {
        vus: u32,
        duration: Duration,
    },
}

impl Executor {
    pub fn name(&self) -> &'static str {
        match self {
            Executor::RampingVus { .. } => "ramping-vus",
            Executor::ConstantVus { .. } => "constant-vus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioPlan {
    pub name: String,
    pub executor: Executor,
    /// Name of the scenario function to run.
    pub exec: String,
    /// Offset from run start before this scenario begins.
    pub start_time: Duration,
    pub graceful_stop: Duration,
}

impl ScenarioPlan {
    /// Grace period given to VUs retired while the scenario is still running.
    pub fn ramp_down_grace(&self) -> Duration {
        match &self.executor {
            Executor::RampingVus {
                graceful_ramp_down, ..
            } => *graceful_ramp_down,
            Executor::ConstantVus { .. } => self.graceful_stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    pub no_connection_reuse: bool,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            no_connection_reuse: false,
            user_agent: default_user_agent(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

fn default_user_agent() -> String {
    format!("loadstage/{}", env!("CARGO_PKG_VERSION"))
}

/// Validated, immutable description of one test run.
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub scenarios: Vec<ScenarioPlan>,
    pub thresholds: Thresholds,
    pub http: HttpOptions,
    pub summary_trend_stats: Vec<Statistic>,
}

impl RawOptions {
    pub fn into_plan(self) -> Result<TestPlan, ConfigError> {
        let shortcut_used = self.stages.is_some() || self.vus.is_some() || self.duration.is_some();
        if shortcut_used && !self.scenarios.is_empty() {
            return Err(ConfigError::Conflict(
                "`stages`, `vus` and `duration` cannot be combined with `scenarios`".into(),
            ));
        }

        let scenarios = if !self.scenarios.is_empty() {
            self.scenarios
                .iter()
                .map(|(name, raw)| raw.to_plan(name))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![shortcut_scenario(&self.stages, self.vus, self.duration.as_deref())?]
        };

        let thresholds = Thresholds::parse(&self.thresholds)?;

        let http = HttpOptions {
            no_connection_reuse: self.no_connection_reuse,
            user_agent: self.user_agent.unwrap_or_else(default_user_agent),
            timeout: self
                .http_timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?
                .unwrap_or(DEFAULT_HTTP_TIMEOUT),
        };
        if http.timeout.is_zero() {
            return Err(ConfigError::Conflict("httpTimeout must be positive".into()));
        }

        let summary_trend_stats = match self.summary_trend_stats {
            Some(names) => parse_trend_stats(names.iter().map(String::as_str))?,
            None => parse_trend_stats(DEFAULT_TREND_STATS.into_iter())?,
        };

        Ok(TestPlan {
            scenarios,
            thresholds,
            http,
            summary_trend_stats,
        })
    }
}

/// Top-level `stages` or `vus` + `duration` become a single "default" scenario.
fn shortcut_scenario(
    stages: &Option<Vec<RawStage>>,
    vus: Option<i64>,
    duration: Option<&str>,
) -> Result<ScenarioPlan, ConfigError> {
    let executor = match (stages, duration) {
        (Some(stages), _) => Executor::RampingVus {
            start_vus: count("vus", vus.unwrap_or(0))?,
            stages: parse_stages(DEFAULT_SCENARIO, stages)?,
            graceful_ramp_down: DEFAULT_GRACEFUL_RAMP_DOWN,
        },
        (None, Some(duration)) => constant_vus(DEFAULT_SCENARIO, vus, Some(duration))?,
        (None, None) if vus.is_some() => {
            return Err(ConfigError::InvalidScenario {
                scenario: DEFAULT_SCENARIO.into(),
                reason: "`vus` needs a `duration` or `stages`".into(),
            })
        }
        (None, None) => return Err(ConfigError::NoScenarios),
    };
    Ok(ScenarioPlan {
        name: DEFAULT_SCENARIO.into(),
        executor,
        exec: DEFAULT_EXEC.into(),
        start_time: Duration::ZERO,
        graceful_stop: DEFAULT_GRACEFUL_STOP,
    })
}

impl RawScenario {
    fn to_plan(&self, name: &str) -> Result<ScenarioPlan, ConfigError> {
        validate_scenario_name(name)?;
        let invalid = |reason: &str| ConfigError::InvalidScenario {
            scenario: name.to_string(),
            reason: reason.to_string(),
        };

        let executor = match self.executor.as_str() {
            "ramping-vus" => {
                if self.vus.is_some() || self.duration.is_some() {
                    return Err(invalid("ramping-vus uses `startVUs` and `stages`, not `vus`/`duration`"));
                }
                let stages = self
                    .stages
                    .as_ref()
                    .ok_or_else(|| invalid("ramping-vus requires `stages`"))?;
                Executor::RampingVus {
                    start_vus: count("startVUs", self.start_vus.unwrap_or(0))?,
                    stages: parse_stages(name, stages)?,
                    graceful_ramp_down: optional_duration(&self.graceful_ramp_down)?
                        .unwrap_or(DEFAULT_GRACEFUL_RAMP_DOWN),
                }
            }
            "constant-vus" => {
                if self.stages.is_some() || self.start_vus.is_some() || self.graceful_ramp_down.is_some() {
                    return Err(invalid(
                        "constant-vus uses `vus` and `duration`, not `stages`/`startVUs`/`gracefulRampDown`",
                    ));
                }
                constant_vus(name, self.vus, self.duration.as_deref())?
            }
            other => return Err(ConfigError::UnknownExecutor(other.to_string())),
        };

        Ok(ScenarioPlan {
            name: name.to_string(),
            executor,
            exec: self.exec.clone().unwrap_or_else(|| DEFAULT_EXEC.to_string()),
            start_time: optional_duration(&self.start_time)?.unwrap_or(Duration::ZERO),
            graceful_stop: optional_duration(&self.graceful_stop)?.unwrap_or(DEFAULT_GRACEFUL_STOP),
        })
    }
}

fn constant_vus(
    scenario: &str,
    vus: Option<i64>,
    duration: Option<&str>,
) -> Result<Executor, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidScenario {
        scenario: scenario.to_string(),
        reason: reason.to_string(),
    };
    let vus = count("vus", vus.unwrap_or(1))?;
    if vus == 0 {
        return Err(invalid("constant-vus needs at least one VU"));
    }
    let duration = parse_duration(duration.ok_or_else(|| invalid("constant-vus requires `duration`"))?)?;
    if duration.is_zero() {
        return Err(invalid("constant-vus `duration` must be positive"));
    }
    Ok(Executor::ConstantVus { vus, duration })
}

fn parse_stages(scenario: &str, raw: &[RawStage]) -> Result<Vec<Stage>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::InvalidScenario {
            scenario: scenario.to_string(),
            reason: "`stages` must not be empty".into(),
        });
    }
    raw.iter()
        .map(|s| {
            Ok(Stage {
                duration: parse_duration(&s.duration)?,
                target: count("target", s.target)?,
            })
        })
        .collect()
}

fn optional_duration(raw: &Option<String>) -> Result<Option<Duration>, ConfigError> {
    raw.as_deref().map(parse_duration).transpose()
}

fn count(field: &str, value: i64) -> Result<u32, ConfigError> {
    if value < 0 {
        return Err(ConfigError::NegativeValue {
            field: field.to_string(),
            value,
        });
    }
    u32::try_from(value).map_err(|_| ConfigError::OutOfRange {
        field: field.to_string(),
        value,
    })
}

fn validate_scenario_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidScenarioName(name.to_string()))
    }
}

fn parse_trend_stats<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<Statistic>, ConfigError> {
    names
        .map(|name| {
            let stat: Statistic = name.parse().map_err(|reason: String| {
                ConfigError::Conflict(format!("summaryTrendStats: {reason}"))
            })?;
            if !stat.applies_to(MetricKind::Trend) {
                return Err(ConfigError::Conflict(format!(
                    "summaryTrendStats: {stat} does not apply to trends"
                )));
            }
            Ok(stat)
        })
        .collect()
}

impl std::fmt::Display for ScenarioPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}", self.name, self.executor.name())?;
        match &self.executor {
            Executor::RampingVus {
                start_vus, stages, ..
            } => {
                let total: Duration = stages.iter().map(|s| s.duration).sum();
                write!(f, ", startVUs {start_vus}, {} stages over {}", stages.len(), Human(total))?;
            }
            Executor::ConstantVus { vus, duration } => {
                write!(f, ", {vus} VUs for {}", Human(*duration))?;
            }
        }
        if !self.start_time.is_zero() {
            write!(f, ", starts at {}", Human(self.start_time))?;
        }
        write!(f, ", gracefulStop {})", Human(self.graceful_stop))
    }
}
