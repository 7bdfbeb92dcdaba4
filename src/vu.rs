//! Virtual users: the per-VU task loop and the context handed to scenario code.

use async_trait::async_trait;
use futures::FutureExt;
use reqwest::Method;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::check::{self, panic_message, Check};
use crate::http::{HttpClient, RequestOptions, Response};
use crate::metrics::{Registry, TagSet, ITERATIONS, ITERATION_DURATION};
use crate::pool::{ScenarioStats, VuCounters};

/// Code run once per iteration by every VU of a scenario.
///
/// Closures of the form `|ctx: VuContext| async move { ... }` implement this
/// trait directly.
#[async_trait]
pub trait ScenarioFn: Send + Sync {
    async fn iteration(&self, ctx: VuContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> ScenarioFn for F
where
    F: Fn(VuContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn iteration(&self, ctx: VuContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Handle given to scenario code for one iteration.
#[derive(Clone)]
pub struct VuContext {
    vu_id: u64,
    id_in_scenario: u64,
    iteration: u64,
    scenario: Arc<str>,
    tags: TagSet,
    client: HttpClient,
    inflight: Arc<AtomicUsize>,
}

impl VuContext {
    /// Run-wide VU id, starting at 1.
    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// VU id within its scenario, starting at 1.
    pub fn id_in_scenario(&self) -> u64 {
        self.id_in_scenario
    }

    /// Zero-based iteration number of this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Tags attached to every sample this VU records.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn registry(&self) -> &Registry {
        self.client.registry()
    }

    pub async fn get(&self, url: &str) -> Response {
        self.request(Method::GET, url, RequestOptions::default())
            .await
    }

    pub async fn request(&self, method: Method, url: &str, options: RequestOptions) -> Response {
        let _inflight = self.track_inflight();
        self.client.request(method, url, options, &self.tags).await
    }

    /// Evaluate `checks` against `response`; true if all passed.
    pub fn check(&self, response: &Response, checks: &[Check]) -> bool {
        check::check(self.client.registry(), &self.tags, response, checks)
    }

    /// Think time between requests.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Record a sample on a custom metric under this VU's tags.
    pub fn add_sample(&self, metric: &str, value: f64) {
        self.client.registry().add(metric, &self.tags, value);
    }

    pub(crate) fn track_inflight(&self) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard(self.inflight.clone())
    }
}

/// Marks a request in flight until dropped.
pub(crate) struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a pool needs to start VUs for one scenario.
#[derive(Clone)]
pub(crate) struct VuTemplate {
    pub scenario: Arc<str>,
    pub exec: Arc<dyn ScenarioFn>,
    pub client: HttpClient,
    pub counters: Arc<VuCounters>,
    pub stats: Arc<ScenarioStats>,
}

/// Pool-side handle to a running VU.
pub(crate) struct VuHandle {
    pub id_in_scenario: u64,
    stop: CancellationToken,
    grace_ms: Arc<AtomicU64>,
    inflight: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl VuHandle {
    /// Spawn a VU. It runs until `stop` plus its grace period, or until `kill`.
    pub fn spawn(template: &VuTemplate, id_in_scenario: u64, kill: CancellationToken) -> Self {
        let vu_id = template.counters.next_id();
        let stop = CancellationToken::new();
        let grace_ms = Arc::new(AtomicU64::new(0));
        let inflight = Arc::new(AtomicUsize::new(0));

        let ctx = VuContext {
            vu_id,
            id_in_scenario,
            iteration: 0,
            scenario: template.scenario.clone(),
            tags: TagSet::new().with("scenario", template.scenario.as_ref()),
            client: template.client.clone(),
            inflight: inflight.clone(),
        };
        let vu = VirtualUser {
            ctx,
            exec: template.exec.clone(),
            counters: template.counters.clone(),
            stats: template.stats.clone(),
            stop: stop.clone(),
            kill,
            grace_ms: grace_ms.clone(),
        };
        let task = tokio::spawn(vu.run());

        Self {
            id_in_scenario,
            stop,
            grace_ms,
            inflight,
            task,
        }
    }

    /// Ask the VU to stop after its current iteration, or after `grace` at most.
    pub fn request_stop(&self, grace: Duration) {
        let ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self.grace_ms.store(ms, Ordering::Release);
        self.stop.cancel();
    }

    pub fn is_busy(&self) -> bool {
        self.inflight.load(Ordering::Acquire) > 0
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(vu = self.id_in_scenario, error = %err, "VU task ended abnormally");
        }
    }
}

struct VirtualUser {
    ctx: VuContext,
    exec: Arc<dyn ScenarioFn>,
    counters: Arc<VuCounters>,
    stats: Arc<ScenarioStats>,
    stop: CancellationToken,
    kill: CancellationToken,
    grace_ms: Arc<AtomicU64>,
}

impl VirtualUser {
    async fn run(mut self) {
        let registry = self.ctx.client.registry().clone();
        self.counters.vu_started(&registry);
        trace!(vu = self.ctx.vu_id, scenario = %self.ctx.scenario, "VU started");

        while !self.stop.is_cancelled() && !self.kill.is_cancelled() {
            let started = Instant::now();
            let work = AssertUnwindSafe(self.exec.iteration(self.ctx.clone())).catch_unwind();

            let outcome = tokio::select! {
                biased;
                _ = self.kill.cancelled() => None,
                _ = grace_expired(&self.stop, &self.grace_ms) => None,
                outcome = work => Some(outcome),
            };

            let Some(outcome) = outcome else {
                self.stats.iteration_interrupted();
                debug!(
                    vu = self.ctx.vu_id,
                    iteration = self.ctx.iteration,
                    "iteration interrupted"
                );
                break;
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.stats.iteration_failed();
                    debug!(vu = self.ctx.vu_id, iteration = self.ctx.iteration, error = %err, "iteration failed");
                }
                Err(panic) => {
                    self.stats.iteration_failed();
                    warn!(
                        vu = self.ctx.vu_id,
                        iteration = self.ctx.iteration,
                        panic = %panic_message(panic.as_ref()),
                        "iteration panicked"
                    );
                }
            }
            registry.add(ITERATIONS, &self.ctx.tags, 1.0);
            registry.add(
                ITERATION_DURATION,
                &self.ctx.tags,
                started.elapsed().as_secs_f64() * 1000.0,
            );
            self.stats.iteration_completed();

            self.ctx.iteration += 1;
            tokio::task::yield_now().await;
        }

        self.counters.vu_stopped(&registry);
        trace!(vu = self.ctx.vu_id, iterations = self.ctx.iteration, "VU stopped");
    }
}

/// Resolves once a stop was requested and its grace period has run out.
async fn grace_expired(stop: &CancellationToken, grace_ms: &AtomicU64) {
    stop.cancelled().await;
    let grace = Duration::from_millis(grace_ms.load(Ordering::Acquire));
    tokio::time::sleep(grace).await;
}
