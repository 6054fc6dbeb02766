use float_cmp::approx_eq;

use crate::types::{StepIndex, Time};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationClock {
    step: StepIndex,
    timestep_size: Time,
}

impl SimulationClock {
    pub fn new(timestep_size: Time) -> Self {
        Self {
            step: 0,
            timestep_size,
        }
    }

    pub fn step(&self) -> StepIndex {
        self.step
    }

    pub fn timestep_size(&self) -> Time {
        self.timestep_size
    }

    pub fn time(&self) -> Time {
        self.step as f64 * self.timestep_size
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// First step whose time is at least `time`.
    ///
    /// Quotients within a few ULPs of an integer count as that integer, so
    /// `0.1 * 3` reaches `0.3` in three steps rather than four.
    pub fn step_at_or_after(&self, time: Time) -> StepIndex {
        if time <= 0.0 {
            return 0;
        }

        let steps = time / self.timestep_size;
        let rounded = steps.round();

        if approx_eq!(f64, steps, rounded, ulps = 4) {
            rounded as StepIndex
        } else {
            steps.ceil() as StepIndex
        }
    }
}
