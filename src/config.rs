//! Plan file loading.
//!
//! A plan is a TOML file merged with `LOADSTAGE__`-prefixed environment
//! variables (`__` separates nested keys, e.g. `LOADSTAGE__SCRIPT__BASE_URL`).

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration;
use crate::engine::{Engine, EngineSettings, DEFAULT_THRESHOLD_INTERVAL, DEFAULT_TICK};
use crate::error::ConfigError;
use crate::options::RawOptions;
use crate::script::{HttpScript, ScriptConfig};

pub const ENV_PREFIX: &str = "LOADSTAGE__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub tick: Option<String>,
    pub threshold_interval: Option<String>,
}

impl EngineConfig {
    pub fn settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            tick: positive("engine.tick", self.tick.as_deref(), DEFAULT_TICK)?,
            threshold_interval: positive(
                "engine.threshold_interval",
                self.threshold_interval.as_deref(),
                DEFAULT_THRESHOLD_INTERVAL,
            )?,
        })
    }
}

fn positive(field: &str, raw: Option<&str>, default: Duration) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value = parse_duration(raw)?;
    if value.is_zero() {
        return Err(ConfigError::Conflict(format!("{field} must be positive")));
    }
    Ok(value)
}

/// Everything a plan file can contain.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub options: RawOptions,
    /// Scenario function for scenarios without an explicit `exec`.
    pub script: Option<ScriptConfig>,
    /// Named scenario functions, selected with a scenario's `exec`.
    #[serde(default)]
    pub exec: BTreeMap<String, ScriptConfig>,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Load(format!(
                "plan file {} does not exist",
                path.display()
            )));
        }
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Ok(figment.extract()?)
    }

    /// Parse a plan from TOML text, without environment overrides.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(Figment::from(Toml::string(source)).extract()?)
    }

    /// Validate the plan and build an engine with its scripts registered.
    ///
    /// `base_url` replaces every script's configured base URL.
    pub fn into_engine(self, base_url: Option<&str>) -> Result<Engine, ConfigError> {
        let settings = self.engine.settings()?;
        let plan = self.options.into_plan()?;
        let mut engine = Engine::new(plan, settings);
        if let Some(script) = &self.script {
            engine = engine.with_default(HttpScript::from_config(script, base_url)?);
        }
        for (name, script) in &self.exec {
            engine = engine.with_exec(name.as_str(), HttpScript::from_config(script, base_url)?);
        }
        Ok(engine)
    }
}
