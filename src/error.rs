use thiserror::Error;

/// Problems found while loading or validating a test plan.
///
/// All of these are fatal and are reported before any virtual user starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load plan: {0}")]
    Load(String),

    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("negative duration {0:?}")]
    NegativeDuration(String),

    #[error("{field} must not be negative, got {value}")]
    NegativeValue { field: String, value: i64 },

    #[error("{field} is out of range: {value}")]
    OutOfRange { field: String, value: i64 },

    #[error("unknown executor {0:?} (expected \"ramping-vus\" or \"constant-vus\")")]
    UnknownExecutor(String),

    #[error("scenario {scenario:?}: {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("invalid scenario name {0:?}: use only alphanumerics, '_', '-' or '.'")]
    InvalidScenarioName(String),

    #[error("options conflict: {0}")]
    Conflict(String),

    #[error("no scenarios configured: set `stages`, `vus` + `duration`, or `scenarios`")]
    NoScenarios,

    #[error("invalid threshold {expression:?} on {metric}: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid metric selector {0:?}")]
    InvalidSelector(String),

    #[error("threshold references unknown metric {0:?}")]
    UnknownMetric(String),

    #[error("statistic {statistic} is not available for {kind} metric {metric:?}")]
    StatisticMismatch {
        metric: String,
        kind: String,
        statistic: String,
    },

    #[error("invalid script: {0}")]
    InvalidScript(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Failures that stop a run as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no scenario function registered for exec {exec:?} (scenario {scenario:?})")]
    MissingExec { scenario: String, exec: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("scenario task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
