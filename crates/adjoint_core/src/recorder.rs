use log::trace;
use serde::{Deserialize, Serialize};

/// States snapshotted at the requested output times, in ascending time order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Stepper times at which each snapshot was taken.
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn last(&self) -> Option<&[f64]> {
        self.states.last().map(Vec::as_slice)
    }
}

/// Step monitor that keeps the states landing on requested output times.
///
/// The cursor only moves forward: a requested time the step grid jumps over
/// is never recorded, and every later time is still matched normally.
#[derive(Debug, Clone)]
pub struct TrajectoryRecorder {
    requested: Vec<f64>,
    cursor: usize,
    tolerance: f64,
    trajectory: Trajectory,
}

impl TrajectoryRecorder {
    pub fn new(tolerance: f64) -> Self {
        Self {
            requested: Vec::new(),
            cursor: 0,
            tolerance,
            trajectory: Trajectory::default(),
        }
    }

    /// Starts a new recording for `times`, dropping the previous trajectory.
    pub fn reset(&mut self, times: &[f64]) {
        self.requested.clear();
        self.requested.extend_from_slice(times);
        self.cursor = 0;
        self.trajectory = Trajectory {
            times: Vec::with_capacity(times.len()),
            states: Vec::with_capacity(times.len()),
        };
    }

    /// Returns true when a snapshot was taken.
    pub fn on_step(&mut self, step: usize, t: f64, u: &[f64]) -> bool {
        let Some(&target) = self.requested.get(self.cursor) else {
            return false;
        };
        if (t - target).abs() >= self.tolerance {
            if t > target + self.tolerance {
                // Skip every requested time the grid has already passed.
                while self
                    .requested
                    .get(self.cursor)
                    .is_some_and(|r| t > r + self.tolerance)
                {
                    trace!("Step {step} at t = {t} passed requested time {}", self.requested[self.cursor]);
                    self.cursor += 1;
                }
                return self.on_step(step, t, u);
            }
            return false;
        }
        trace!("Recording output {} at step {step}, t = {t}", self.cursor);
        self.trajectory.times.push(t);
        self.trajectory.states.push(u.to_vec());
        self.cursor += 1;
        true
    }

    pub fn recorded(&self) -> usize {
        self.trajectory.len()
    }

    pub fn requested(&self) -> usize {
        self.requested.len()
    }

    pub fn is_complete(&self) -> bool {
        self.trajectory.len() == self.requested.len()
    }

    /// First requested time without a snapshot.
    pub fn first_missed(&self) -> Option<f64> {
        let mut recorded = self.trajectory.times.iter().peekable();
        for &r in &self.requested {
            match recorded.peek() {
                Some(&&t) if (t - r).abs() < self.tolerance => {
                    recorded.next();
                }
                _ => return Some(r),
            }
        }
        None
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn take(&mut self) -> Trajectory {
        std::mem::take(&mut self.trajectory)
    }
}
