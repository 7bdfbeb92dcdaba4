//! # Engine
//!
//! Runs a [`TestPlan`] end to end.
//!
//! ## Components
//!
//! - **Engine**: validates the plan against the registered scenario functions
//!   and metric definitions, then runs every scenario concurrently
//! - **ScenarioDriver**: per-scenario tick loop feeding the schedule to a VU pool
//! - **Abort watcher**: periodic evaluation of `abortOnFail` thresholds
//!
//! Cancellation flows down a token tree: the engine token (signals) → the run
//! token (threshold aborts) → per-scenario pool tokens → per-VU kill tokens.

mod scenario;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::http::HttpClient;
use crate::metrics::{Registry, TagSet, VUS_MAX};
use crate::options::{TestPlan, DEFAULT_EXEC};
use crate::pool::{ScenarioStats, VuCounters};
use crate::scheduler::Schedule;
use crate::summary::{AbortReason, RunReport, ScenarioSummary};
use crate::thresholds::ThresholdResult;
use crate::vu::ScenarioFn;

use scenario::ScenarioDriver;

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(2);

/// Engine timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// How often each scenario re-reads its schedule.
    pub tick: Duration,
    /// How often `abortOnFail` thresholds are evaluated.
    pub threshold_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            threshold_interval: DEFAULT_THRESHOLD_INTERVAL,
        }
    }
}

pub struct Engine {
    plan: TestPlan,
    settings: EngineSettings,
    registry: Arc<Registry>,
    execs: HashMap<String, Arc<dyn ScenarioFn>>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(plan: TestPlan, settings: EngineSettings) -> Self {
        Self {
            plan,
            settings,
            registry: Arc::new(Registry::new()),
            execs: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The run's metric registry; define custom metrics here before [`Engine::run`].
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn plan(&self) -> &TestPlan {
        &self.plan
    }

    /// Register the scenario function used by scenarios with `exec = name`.
    pub fn with_exec(mut self, name: impl Into<String>, exec: impl ScenarioFn + 'static) -> Self {
        self.execs.insert(name.into(), Arc::new(exec));
        self
    }

    /// Register the function for scenarios without an explicit `exec`.
    pub fn with_default(self, exec: impl ScenarioFn + 'static) -> Self {
        self.with_exec(DEFAULT_EXEC, exec)
    }

    /// Cancelling this token interrupts the run; the report then carries
    /// [`AbortReason::Interrupted`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Check thresholds against metric definitions and every scenario's `exec`.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.plan
            .thresholds
            .validate(|name| self.registry.definition(name))?;
        for scenario in &self.plan.scenarios {
            if !self.execs.contains_key(&scenario.exec) {
                return Err(EngineError::MissingExec {
                    scenario: scenario.name.clone(),
                    exec: scenario.exec.clone(),
                });
            }
        }
        Ok(())
    }

    pub async fn run(self) -> Result<RunReport, EngineError> {
        self.validate()?;
        let client = HttpClient::new(&self.plan.http, self.registry.clone())?;
        let counters = Arc::new(VuCounters::default());
        let run = self.cancel.child_token();

        let vus_max: u32 = self
            .plan
            .scenarios
            .iter()
            .map(|s| Schedule::for_executor(&s.executor).max_vus())
            .sum();
        self.registry.start_clock();
        self.registry.add(VUS_MAX, &TagSet::new(), f64::from(vus_max));
        info!(scenarios = self.plan.scenarios.len(), vus_max, "test run starting");

        let mut tasks = JoinSet::new();
        let mut stats = Vec::with_capacity(self.plan.scenarios.len());
        for plan in &self.plan.scenarios {
            let Some(exec) = self.execs.get(&plan.exec).cloned() else {
                continue;
            };
            let scenario_stats = Arc::new(ScenarioStats::default());
            stats.push((plan.name.clone(), plan.executor.name(), scenario_stats.clone()));
            let driver = ScenarioDriver {
                plan: plan.clone(),
                exec,
                client: client.clone(),
                counters: counters.clone(),
                stats: scenario_stats,
                tick: self.settings.tick,
            };
            tasks.spawn(driver.run(run.clone()));
        }

        let tripped = self.supervise(&mut tasks, &run).await?;

        self.registry.seal();
        let snapshot = self.registry.snapshot();
        let results = self.plan.thresholds.evaluate(&snapshot);

        let aborted = if self.cancel.is_cancelled() {
            Some(AbortReason::Interrupted)
        } else {
            tripped.map(|t| AbortReason::Threshold {
                metric: t.metric,
                expression: t.expression,
            })
        };
        let scenarios = stats
            .into_iter()
            .map(|(name, executor, stats)| ScenarioSummary {
                name,
                executor: executor.to_string(),
                counts: stats.counts(),
            })
            .collect();

        let report = RunReport::build(
            snapshot,
            results,
            &self.plan.summary_trend_stats,
            scenarios,
            aborted,
        );
        info!(
            passed = report.passed(),
            duration_secs = report.duration_secs,
            "test run finished"
        );
        Ok(report)
    }

    /// Wait for every scenario, checking abort-on-fail thresholds on the way.
    ///
    /// Returns the threshold that aborted the run, if any.
    async fn supervise(
        &self,
        tasks: &mut JoinSet<()>,
        run: &CancellationToken,
    ) -> Result<Option<ThresholdResult>, EngineError> {
        let watch = self.plan.thresholds.has_abort_on_fail();
        let mut interval = time::interval(self.settings.threshold_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tripped = None;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        error!(error = %err, "scenario task failed");
                        run.cancel();
                        while tasks.join_next().await.is_some() {}
                        return Err(err.into());
                    }
                },
                _ = interval.tick(), if watch && tripped.is_none() => {
                    if let Some(failed) = self.plan.thresholds.first_abort(&self.registry.snapshot()) {
                        warn!(
                            metric = %failed.metric,
                            threshold = %failed.expression,
                            observed = ?failed.observed,
                            "abort-on-fail threshold crossed, stopping run"
                        );
                        run.cancel();
                        tripped = Some(failed);
                    }
                }
            }
        }
        Ok(tripped)
    }
}
