//! Target concurrency over time for one scenario.
//!
//! [`Schedule`] is a pure function of elapsed scenario time. The scenario
//! driver in [`crate::engine`] samples it on every tick and hands the result
//! to the VU pool.

use std::time::Duration;

use crate::options::{Executor, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Ramping { start_vus: u32, stages: Vec<Stage> },
    Constant { vus: u32, duration: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    shape: Shape,
}

impl Schedule {
    pub fn for_executor(executor: &Executor) -> Self {
        let shape = match executor {
            Executor::RampingVus {
                start_vus, stages, ..
            } => Shape::Ramping {
                start_vus: *start_vus,
                stages: stages.clone(),
            },
            Executor::ConstantVus { vus, duration } => Shape::Constant {
                vus: *vus,
                duration: *duration,
            },
        };
        Self { shape }
    }

    pub fn ramping(start_vus: u32, stages: Vec<Stage>) -> Self {
        Self {
            shape: Shape::Ramping { start_vus, stages },
        }
    }

    pub fn constant(vus: u32, duration: Duration) -> Self {
        Self {
            shape: Shape::Constant { vus, duration },
        }
    }

    /// Time from scenario start until the scenario's last stage ends.
    pub fn total_duration(&self) -> Duration {
        match &self.shape {
            Shape::Ramping { stages, .. } => stages.iter().map(|s| s.duration).sum(),
            Shape::Constant { duration, .. } => *duration,
        }
    }

    /// Instantaneous target concurrency at `elapsed` since scenario start.
    ///
    /// Ramping stages interpolate linearly from the previous target. Rising
    /// values are floored and falling values ceiled, so the result always lies
    /// between the two adjacent targets and hits each target exactly at its
    /// stage boundary. Past the scenario's end the target is 0.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        match &self.shape {
            Shape::Constant { vus, duration } => {
                if elapsed < *duration {
                    *vus
                } else {
                    0
                }
            }
            Shape::Ramping { start_vus, stages } => {
                let mut from = *start_vus;
                let mut offset = Duration::ZERO;
                for stage in stages {
                    let end = offset + stage.duration;
                    if elapsed < end {
                        return interpolate(from, stage.target, elapsed - offset, stage.duration);
                    }
                    from = stage.target;
                    offset = end;
                }
                if elapsed == offset {
                    from
                } else {
                    0
                }
            }
        }
    }

    /// Highest concurrency the schedule ever asks for.
    pub fn max_vus(&self) -> u32 {
        match &self.shape {
            Shape::Constant { vus, .. } => *vus,
            Shape::Ramping { start_vus, stages } => stages
                .iter()
                .map(|s| s.target)
                .fold(*start_vus, u32::max),
        }
    }

    /// `(offset, target)` at scenario start and at every stage boundary.
    pub fn checkpoints(&self) -> Vec<(Duration, u32)> {
        match &self.shape {
            Shape::Constant { vus, duration } => vec![(Duration::ZERO, *vus), (*duration, 0)],
            Shape::Ramping { start_vus, stages } => {
                let mut points = vec![(Duration::ZERO, *start_vus)];
                let mut offset = Duration::ZERO;
                for stage in stages {
                    offset += stage.duration;
                    points.push((offset, stage.target));
                }
                points
            }
        }
    }
}

fn interpolate(from: u32, to: u32, into_stage: Duration, stage: Duration) -> u32 {
    let progress = (into_stage.as_secs_f64() / stage.as_secs_f64()).clamp(0.0, 1.0);
    let value = from as f64 + (to as f64 - from as f64) * progress;
    let rounded = if to >= from { value.floor() } else { value.ceil() };
    (rounded as u32).clamp(from.min(to), from.max(to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn stage(s: u64, target: u32) -> Stage {
        Stage {
            duration: secs(s),
            target,
        }
    }

    #[test]
    fn ramp_hold_ramp_down_profile() {
        let schedule = Schedule::ramping(0, vec![stage(2, 2), stage(6, 2), stage(2, 0)]);
        assert_eq!(schedule.total_duration(), secs(10));
        assert_eq!(schedule.target_at(Duration::ZERO), 0);
        assert_eq!(schedule.target_at(Duration::from_millis(1500)), 1);
        for t in [2000, 3000, 5000, 7999, 8000] {
            assert_eq!(schedule.target_at(Duration::from_millis(t)), 2, "t={t}ms");
        }
        assert_eq!(schedule.target_at(Duration::from_millis(9000)), 1);
        assert_eq!(schedule.target_at(secs(10)), 0);
        assert_eq!(schedule.target_at(secs(11)), 0);
        assert_eq!(schedule.max_vus(), 2);
    }

    #[test]
    fn spike_profile_reaches_peak_at_boundary() {
        let schedule = Schedule::ramping(
            0,
            vec![stage(30, 10), stage(5, 50), stage(60, 50), stage(10, 10), stage(30, 0)],
        );
        assert_eq!(schedule.target_at(secs(30)), 10);
        assert_eq!(schedule.target_at(secs(35)), 50);
        assert_eq!(schedule.target_at(secs(95)), 50);
        assert_eq!(schedule.target_at(secs(105)), 10);
        assert_eq!(schedule.max_vus(), 50);
    }

    #[test]
    fn zero_length_stage_jumps() {
        let schedule = Schedule::ramping(1, vec![stage(0, 5), stage(10, 5)]);
        assert_eq!(schedule.target_at(Duration::ZERO), 5);
        assert_eq!(schedule.target_at(secs(4)), 5);
    }

    #[test]
    fn all_zero_targets_never_ask_for_vus() {
        let schedule = Schedule::ramping(0, vec![stage(5, 0), stage(5, 0)]);
        for t in 0..=12 {
            assert_eq!(schedule.target_at(secs(t)), 0);
        }
        assert_eq!(schedule.max_vus(), 0);
    }

    #[test]
    fn constant_holds_then_drops() {
        let schedule = Schedule::constant(4, secs(60));
        assert_eq!(schedule.target_at(Duration::ZERO), 4);
        assert_eq!(schedule.target_at(secs(59)), 4);
        assert_eq!(schedule.target_at(secs(60)), 0);
        assert_eq!(schedule.checkpoints(), vec![(Duration::ZERO, 4), (secs(60), 0)]);
    }

    #[test]
    fn checkpoints_list_stage_boundaries() {
        let schedule = Schedule::ramping(0, vec![stage(2, 2), stage(6, 2), stage(2, 0)]);
        assert_eq!(
            schedule.checkpoints(),
            vec![(Duration::ZERO, 0), (secs(2), 2), (secs(8), 2), (secs(10), 0)]
        );
    }

    fn stages_strategy() -> impl Strategy<Value = (u32, Vec<Stage>)> {
        (
            0u32..50,
            prop::collection::vec((0u64..20_000, 0u32..200), 1..8),
        )
            .prop_map(|(start, raw)| {
                let stages = raw
                    .into_iter()
                    .map(|(ms, target)| Stage {
                        duration: Duration::from_millis(ms),
                        target,
                    })
                    .collect();
                (start, stages)
            })
    }

    proptest! {
        #[test]
        fn target_stays_between_adjacent_targets(
            (start, stages) in stages_strategy(),
            fraction in 0.0f64..1.0,
        ) {
            let schedule = Schedule::ramping(start, stages.clone());
            let total = schedule.total_duration();
            let t = total.mul_f64(fraction);
            let value = schedule.target_at(t);

            let mut from = start;
            let mut offset = Duration::ZERO;
            for stage in &stages {
                let end = offset + stage.duration;
                if t < end {
                    prop_assert!(value >= from.min(stage.target));
                    prop_assert!(value <= from.max(stage.target));
                    break;
                }
                from = stage.target;
                offset = end;
            }
        }

        #[test]
        fn target_is_exact_at_boundaries((start, stages) in stages_strategy()) {
            let schedule = Schedule::ramping(start, stages.clone());
            let mut offset = Duration::ZERO;
            for (i, stage) in stages.iter().enumerate() {
                offset += stage.duration;
                // A zero-length stage shares its boundary with the next one.
                let next_is_instant = stages.get(i + 1).is_some_and(|s| s.duration.is_zero());
                if !next_is_instant {
                    prop_assert_eq!(schedule.target_at(offset), stage.target);
                }
            }
        }
    }
}
