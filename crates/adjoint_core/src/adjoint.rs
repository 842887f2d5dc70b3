//! Backward pass over a recorded trajectory, one output interval at a time.

use crate::error::{check_len, Result, SolveError};
use crate::session::IntegrationSession;
use crate::traits::DifferentiableFunction;
use log::trace;
use serde::{Deserialize, Serialize};

/// Gradients of a scalar loss with respect to the initial state and θ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjointState {
    pub state_adjoint: Vec<f64>,
    pub parameter_adjoint: Vec<f64>,
}

/// Drives the session's stepper backwards through the intervals of the last
/// forward solve, injecting ∂L/∂u(t_i) at every interior output time.
pub struct AdjointOrchestrator<'s, F: DifferentiableFunction> {
    session: &'s mut IntegrationSession<F>,
}

impl<'s, F: DifferentiableFunction> AdjointOrchestrator<'s, F> {
    pub fn new(session: &'s mut IntegrationSession<F>) -> Self {
        Self { session }
    }

    /// `grad_output[i]` is ∂L/∂u(times[i]); `times` must be the output times
    /// of the session's most recent forward solve.
    pub fn run(&mut self, times: &[f64], grad_output: &[Vec<f64>]) -> Result<AdjointState> {
        let n = self.session.dimension();
        let p = self.session.num_parameters();
        check_len("trajectory gradients", times.len(), grad_output.len())?;
        for g in grad_output {
            check_len("trajectory gradient", n, g.len())?;
        }
        let Some(last) = grad_output.last() else {
            return Err(SolveError::InvalidOutputTimes("No output times given.".to_string()));
        };
        if times.len() == 1 {
            return Ok(AdjointState {
                state_adjoint: last.clone(),
                parameter_adjoint: vec![0.0; p],
            });
        }
        self.check_times(times)?;

        self.session.begin_adjoint(last)?;
        for i in (1..times.len()).rev() {
            self.session.adjoint_solve(times[i], times[i - 1])?;
            self.session.add_forcing(&grad_output[i - 1])?;
            let (lambda, mu) = self.session.cost_gradients();
            trace!(
                "Adjoint at t = {}: |lambda| = {:.3e}, |mu| = {:.3e}",
                times[i - 1],
                norm(lambda),
                norm(mu)
            );
        }

        let (lambda, mu) = self.session.cost_gradients();
        Ok(AdjointState {
            state_adjoint: lambda.to_vec(),
            parameter_adjoint: mu.to_vec(),
        })
    }

    fn check_times(&self, times: &[f64]) -> Result<()> {
        let recorded = self.session.output_times();
        let tolerance = self.session.settings().output_tolerance;
        let matches = recorded.len() == times.len()
            && recorded
                .iter()
                .zip(times)
                .all(|(a, b)| (a - b).abs() <= tolerance);
        if !matches {
            return Err(SolveError::AdjointUnavailable(
                "Output times differ from the last forward solve.".to_string(),
            ));
        }
        Ok(())
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}
