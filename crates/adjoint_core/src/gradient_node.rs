//! Differentiable ODE solve exposed as a custom-gradient node.

use crate::adjoint::AdjointOrchestrator;
use crate::autodiff::{CustomBackward, Tape, Var};
use crate::error::{Result, SolveError};
use crate::recorder::Trajectory;
use crate::session::{validate_function, IntegrationSession};
use crate::traits::DifferentiableFunction;
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

/// An operation with a hand-written backward pass.
///
/// `backward` returns one optional gradient per input slot; `None` marks an
/// input that is not differentiable.
pub trait CustomGradient {
    type Input;
    type Output;
    /// State saved by `forward` for `backward`.
    type Saved;
    type GradOutput: ?Sized;

    fn forward(&mut self, input: Self::Input) -> Result<(Self::Output, Self::Saved)>;

    fn backward(&mut self, saved: &Self::Saved, grad_output: &Self::GradOutput) -> Result<Vec<Option<Vec<f64>>>>;
}

/// Inputs of a differentiable solve. The session itself is the fourth,
/// implicit input.
#[derive(Debug, Clone)]
pub struct SolveInput {
    pub u0: Vec<f64>,
    pub times: Vec<f64>,
    pub params: Vec<f64>,
}

/// What the backward pass needs from the forward solve.
#[derive(Debug, Clone)]
pub struct SavedSolve {
    pub times: Vec<f64>,
    pub params: Vec<f64>,
    pub trajectory: Trajectory,
    /// Session solve count right after the forward solve.
    pub solve_id: u64,
}

/// Forward: solve without gradient tracking. Backward: adjoint over the saved
/// times and θ; gradient slots are (u0, times, θ, session). The session's θ is
/// the same before and after `backward`.
pub struct DifferentiableSolveNode<'s, F: DifferentiableFunction> {
    session: &'s mut IntegrationSession<F>,
}

impl<'s, F: DifferentiableFunction> DifferentiableSolveNode<'s, F> {
    pub fn new(session: &'s mut IntegrationSession<F>) -> Self {
        Self { session }
    }
}

impl<F: DifferentiableFunction> CustomGradient for DifferentiableSolveNode<'_, F> {
    type Input = SolveInput;
    type Output = Trajectory;
    type Saved = SavedSolve;
    type GradOutput = [Vec<f64>];

    fn forward(&mut self, input: SolveInput) -> Result<(Trajectory, SavedSolve)> {
        self.session.set_parameters(&input.params)?;
        let t0 = input.times.first().copied().unwrap_or(0.0);
        validate_function(self.session.function(), t0, &input.u0)?;
        let trajectory = self.session.odeint(&input.u0, &input.times)?;
        let saved = SavedSolve {
            times: input.times,
            params: input.params,
            trajectory: trajectory.clone(),
            solve_id: self.session.solve_count(),
        };
        Ok((trajectory, saved))
    }

    fn backward(&mut self, saved: &SavedSolve, grad_output: &[Vec<f64>]) -> Result<Vec<Option<Vec<f64>>>> {
        let current = self.session.solve_count();
        if current != saved.solve_id {
            return Err(SolveError::StaleSolve {
                saved: saved.solve_id,
                current,
            });
        }
        if saved.trajectory.len() != saved.times.len() {
            return Err(SolveError::AdjointUnavailable(format!(
                "Trajectory holds {} of {} output times.",
                saved.trajectory.len(),
                saved.times.len()
            )));
        }
        let adjoint = if self.session.parameters() != saved.params.as_slice() {
            debug!("Running the adjoint of solve {} with its saved parameters", saved.solve_id);
            let current = self.session.parameters().to_vec();
            self.session.set_parameters(&saved.params)?;
            let adjoint = AdjointOrchestrator::new(self.session).run(&saved.times, grad_output);
            self.session.set_parameters(&current)?;
            adjoint?
        } else {
            AdjointOrchestrator::new(self.session).run(&saved.times, grad_output)?
        };
        Ok(vec![
            Some(adjoint.state_adjoint),
            None,
            Some(adjoint.parameter_adjoint),
            None,
        ])
    }
}

/// Tape-side backward of a solve recorded by [`odeint_adjoint`].
struct GraphSolveNode<F: DifferentiableFunction> {
    session: Rc<RefCell<IntegrationSession<F>>>,
    saved: SavedSolve,
    dimension: usize,
}

impl<F: DifferentiableFunction> CustomBackward for GraphSolveNode<F> {
    fn backward(&mut self, grad_output: &[f64]) -> Result<Vec<Option<Vec<f64>>>> {
        let grads: Vec<Vec<f64>> = grad_output
            .chunks(self.dimension)
            .map(<[f64]>::to_vec)
            .collect();
        let mut session = self.session.try_borrow_mut().map_err(|e| {
            SolveError::AdjointUnavailable(format!("Session is already in use: {e}"))
        })?;
        DifferentiableSolveNode::new(&mut *session).backward(&self.saved, &grads)
    }
}

/// Solves the ODE from the tape variables `u0` and `params` and returns one
/// row of tape variables per output time. Differentiating anything built from
/// those rows runs the adjoint pass and yields gradients for `u0` and `params`.
///
/// The gradients enter the tape as constants, so the result supports first
/// derivatives only.
pub fn odeint_adjoint<F: DifferentiableFunction + 'static>(
    session: &Rc<RefCell<IntegrationSession<F>>>,
    tape: &mut Tape,
    u0: &[Var],
    times: &[f64],
    params: &[Var],
) -> Result<Vec<Vec<Var>>> {
    let input = SolveInput {
        u0: tape.values(u0),
        times: times.to_vec(),
        params: tape.values(params),
    };
    let (trajectory, saved) = {
        let mut s = session.try_borrow_mut().map_err(|e| {
            SolveError::AdjointUnavailable(format!("Session is already in use: {e}"))
        })?;
        DifferentiableSolveNode::new(&mut *s).forward(input)?
    };

    let dimension = u0.len();
    let flat: Vec<f64> = trajectory.states.concat();
    let node = GraphSolveNode {
        session: Rc::clone(session),
        saved,
        dimension,
    };
    let outputs = tape.custom(
        vec![u0.to_vec(), Vec::new(), params.to_vec(), Vec::new()],
        &flat,
        Box::new(node),
    );
    Ok(outputs.chunks(dimension).map(<[Var]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::EquationSystem;
    use crate::session::SessionSettings;
    use crate::solvers::Method;
    use approx::assert_relative_eq;

    fn decay_session() -> IntegrationSession<EquationSystem> {
        let f = EquationSystem::compile(&["u".to_string()], &["k".to_string()], &["-k * u"], vec![1.0])
            .unwrap();
        let settings = SessionSettings::default()
            .with_method(Method::Euler)
            .with_step_size(0.1);
        IntegrationSession::new(f, settings).unwrap()
    }

    fn input(k: f64) -> SolveInput {
        SolveInput {
            u0: vec![0.5],
            times: vec![0.0, 1.0, 2.0],
            params: vec![k],
        }
    }

    #[test]
    fn backward_fills_only_differentiable_slots() {
        let mut session = decay_session();
        let mut node = DifferentiableSolveNode::new(&mut session);
        let (traj, saved) = node.forward(input(1.0)).unwrap();
        assert_eq!(traj.len(), 3);
        let grads = node
            .backward(&saved, &[vec![0.0], vec![0.0], vec![1.0]])
            .unwrap();
        assert_eq!(grads.len(), 4);
        assert!(grads[1].is_none() && grads[3].is_none());
        assert_relative_eq!(grads[0].as_ref().unwrap()[0], 0.9f64.powi(20), max_relative = 1e-12);
        assert_eq!(grads[2].as_ref().unwrap().len(), 1);
    }

    #[test]
    fn backward_after_a_newer_solve_is_stale() {
        let mut session = decay_session();
        let (_, saved) = DifferentiableSolveNode::new(&mut session)
            .forward(input(1.0))
            .unwrap();
        session.odeint(&[1.0], &[0.0, 0.5]).unwrap();
        let err = DifferentiableSolveNode::new(&mut session)
            .backward(&saved, &[vec![0.0], vec![0.0], vec![1.0]])
            .unwrap_err();
        assert!(matches!(err, SolveError::StaleSolve { saved: 1, current: 2 }));
    }

    #[test]
    fn backward_uses_saved_parameters_and_keeps_current_ones() {
        let mut session = decay_session();
        let (_, saved) = DifferentiableSolveNode::new(&mut session)
            .forward(input(1.0))
            .unwrap();
        session.set_parameters(&[3.0]).unwrap();
        let grads = DifferentiableSolveNode::new(&mut session)
            .backward(&saved, &[vec![0.0], vec![0.0], vec![1.0]])
            .unwrap();
        assert_relative_eq!(grads[0].as_ref().unwrap()[0], 0.9f64.powi(20), max_relative = 1e-12);
        assert_eq!(session.parameters(), &[3.0]);
    }

    #[test]
    fn tape_loss_differentiates_through_the_solve() {
        let session = Rc::new(RefCell::new(decay_session()));
        let mut tape = Tape::new();
        let u0 = tape.variables(&[0.5]);
        let k = tape.variables(&[1.0]);
        let rows = odeint_adjoint(&session, &mut tape, &u0, &[0.0, 1.0, 2.0], &k).unwrap();
        assert_eq!(rows.len(), 3);

        // L = 2·u(2)
        let two = tape.constant(2.0);
        let loss = tape.mul(two, rows[2][0]);
        let one = tape.constant(1.0);
        let grads = tape.grad(&[loss], &[u0[0], k[0]], &[one]).unwrap();
        let du0 = tape.value(grads[0].unwrap());
        assert_relative_eq!(du0, 2.0 * 0.9f64.powi(20), max_relative = 1e-12);
        let dk = tape.value(grads[1].unwrap());
        let expected = 2.0 * -20.0 * 0.1 * 0.5 * 0.9f64.powi(19);
        assert_relative_eq!(dk, expected, max_relative = 1e-10);
    }

    #[test]
    fn busy_session_is_reported() {
        let session = Rc::new(RefCell::new(decay_session()));
        let _guard = session.borrow_mut();
        let mut tape = Tape::new();
        let u0 = tape.variables(&[0.5]);
        let k = tape.variables(&[1.0]);
        let err = odeint_adjoint(&session, &mut tape, &u0, &[0.0, 1.0], &k).unwrap_err();
        assert!(matches!(err, SolveError::AdjointUnavailable(_)));
    }
}
