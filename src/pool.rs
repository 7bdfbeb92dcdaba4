//! Dynamic set of virtual users for one scenario.
//!
//! ## Components
//!
//! - **VuPool**: spawns and retires VUs to follow the scheduler's target
//! - **ScenarioStats**: iteration and VU counters shared with every VU task
//! - **VuCounters**: run-wide VU id allocation and live-VU count (the `vus` gauge)

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::http::HttpClient;
use crate::metrics::{Registry, TagSet, VUS};
use crate::vu::{ScenarioFn, VuHandle, VuTemplate};

/// Run-wide VU bookkeeping shared by all pools.
#[derive(Debug, Default)]
pub struct VuCounters {
    next_id: AtomicU64,
    live: Mutex<u64>,
}

impl VuCounters {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a VU in and write the new total to the `vus` gauge.
    pub(crate) fn vu_started(&self, registry: &Registry) {
        let mut live = self.live.lock();
        *live += 1;
        registry.add(VUS, &TagSet::new(), *live as f64);
    }

    pub(crate) fn vu_stopped(&self, registry: &Registry) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        registry.add(VUS, &TagSet::new(), *live as f64);
    }

    /// VUs currently running across all scenarios.
    pub fn live(&self) -> u64 {
        *self.live.lock()
    }
}

#[derive(Debug, Default)]
pub struct ScenarioStats {
    vus_started: AtomicU64,
    peak_vus: AtomicU64,
    completed: AtomicU64,
    interrupted: AtomicU64,
    failed: AtomicU64,
}

impl ScenarioStats {
    pub(crate) fn iteration_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iteration_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iteration_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> ScenarioCounts {
        ScenarioCounts {
            vus_started: self.vus_started.load(Ordering::Relaxed),
            peak_vus: self.peak_vus.load(Ordering::Relaxed),
            iterations_completed: self.completed.load(Ordering::Relaxed),
            iterations_interrupted: self.interrupted.load(Ordering::Relaxed),
            iterations_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ScenarioStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioCounts {
    pub vus_started: u64,
    pub peak_vus: u64,
    /// Iterations that ran to the end, including ones that returned an error.
    pub iterations_completed: u64,
    /// Iterations cut off by a forced stop.
    pub iterations_interrupted: u64,
    /// Completed iterations that returned an error or panicked.
    pub iterations_failed: u64,
}

pub struct VuPool {
    template: VuTemplate,
    kill: CancellationToken,
    /// VUs that have not been asked to stop, oldest first.
    active: Vec<VuHandle>,
    /// VUs asked to stop that may still be finishing an iteration.
    retiring: Vec<VuHandle>,
    next_in_scenario: u64,
}

impl VuPool {
    /// `kill` hard-stops every VU of the pool when cancelled.
    pub fn new(
        scenario: &str,
        exec: Arc<dyn ScenarioFn>,
        client: HttpClient,
        counters: Arc<VuCounters>,
        stats: Arc<ScenarioStats>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            template: VuTemplate {
                scenario: Arc::from(scenario),
                exec,
                client,
                counters,
                stats,
            },
            kill,
            active: Vec::new(),
            retiring: Vec::new(),
            next_in_scenario: 0,
        }
    }

    /// VUs that are running and not asked to stop.
    pub fn live(&self) -> usize {
        self.active.len()
    }

    /// VUs asked to stop that have not exited yet.
    pub fn retiring(&self) -> usize {
        self.retiring.iter().filter(|vu| !vu.is_finished()).count()
    }

    pub fn stats(&self) -> &Arc<ScenarioStats> {
        &self.template.stats
    }

    /// Grow or shrink to `target` live VUs.
    ///
    /// Retired VUs get `grace` to finish their current iteration. Idle VUs are
    /// retired before VUs with a request in flight, newest first within each group.
    pub fn scale_to(&mut self, target: usize, grace: Duration) {
        self.reap();
        let current = self.active.len();

        if target > current {
            if self.kill.is_cancelled() {
                return;
            }
            for _ in current..target {
                self.next_in_scenario += 1;
                let vu = VuHandle::spawn(&self.template, self.next_in_scenario, self.kill.child_token());
                self.active.push(vu);
            }
            let stats = &self.template.stats;
            stats
                .vus_started
                .fetch_add((target - current) as u64, Ordering::Relaxed);
            stats.peak_vus.fetch_max(target as u64, Ordering::Relaxed);
            debug!(scenario = %self.template.scenario, from = current, to = target, "scaled up");
        } else if target < current {
            // Busy flags change under our feet; read each one once.
            self.active
                .sort_by_cached_key(|vu| (vu.is_busy(), std::cmp::Reverse(vu.id_in_scenario)));
            let victims: Vec<VuHandle> = self.active.drain(..current - target).collect();
            for vu in victims {
                vu.request_stop(grace);
                self.retiring.push(vu);
            }
            self.active.sort_by_key(|vu| vu.id_in_scenario);
            debug!(scenario = %self.template.scenario, from = current, to = target, "scaled down");
        }
    }

    /// Retire every VU with `grace` and wait until all of them have exited.
    pub async fn stop_all(&mut self, grace: Duration) {
        for vu in self.active.drain(..) {
            vu.request_stop(grace);
            self.retiring.push(vu);
        }
        for vu in self.retiring.drain(..) {
            vu.join().await;
        }
    }

    fn reap(&mut self) {
        self.retiring.retain(|vu| !vu.is_finished());
        self.active.retain(|vu| !vu.is_finished());
    }

    #[cfg(test)]
    fn active_ids(&self) -> Vec<u64> {
        self.active.iter().map(|vu| vu.id_in_scenario).collect()
    }
}
