use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::duration::Human;
use crate::http::HttpClient;
use crate::options::ScenarioPlan;
use crate::pool::{ScenarioStats, VuCounters, VuPool};
use crate::scheduler::Schedule;
use crate::vu::ScenarioFn;

/// Drives one scenario: waits for its start time, follows the schedule on
/// every tick, then stops all of its VUs.
pub(crate) struct ScenarioDriver {
    pub plan: ScenarioPlan,
    pub exec: Arc<dyn ScenarioFn>,
    pub client: HttpClient,
    pub counters: Arc<VuCounters>,
    pub stats: Arc<ScenarioStats>,
    pub tick: Duration,
}

impl ScenarioDriver {
    /// Cancelling `run` hard-stops the scenario's VUs.
    pub async fn run(self, run: CancellationToken) {
        let name = self.plan.name.clone();
        if !self.plan.start_time.is_zero() {
            debug!(scenario = %name, start_time = %Human(self.plan.start_time), "waiting for start time");
            tokio::select! {
                _ = run.cancelled() => return,
                _ = time::sleep(self.plan.start_time) => {}
            }
        }

        let schedule = Schedule::for_executor(&self.plan.executor);
        let mut pool = VuPool::new(
            &name,
            self.exec,
            self.client,
            self.counters,
            self.stats,
            run.child_token(),
        );
        let ramp_down = self.plan.ramp_down_grace();

        info!(scenario = %self.plan, "scenario started");
        let started = Instant::now();
        let end = time::sleep_until(started + schedule.total_duration());
        tokio::pin!(end);
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = run.cancelled() => break,
                _ = &mut end => break,
                _ = ticker.tick() => {
                    let target = schedule.target_at(started.elapsed());
                    pool.scale_to(target as usize, ramp_down);
                }
            }
        }

        let stopping = pool.live() + pool.retiring();
        debug!(scenario = %name, vus = stopping, grace = %Human(self.plan.graceful_stop), "stopping scenario");
        pool.stop_all(self.plan.graceful_stop).await;

        let counts = pool.stats().counts();
        info!(
            scenario = %name,
            iterations = counts.iterations_completed,
            interrupted = counts.iterations_interrupted,
            elapsed = %Human(started.elapsed()),
            "scenario finished"
        );
    }
}
