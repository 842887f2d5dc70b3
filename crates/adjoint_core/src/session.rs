use crate::cache::EvaluationCache;
use crate::error::{check_len, Result, SolveError};
use crate::operators::{EquationForm, ForwardOperator, JacobianShell, ParameterJacobianShell};
use crate::recorder::{Trajectory, TrajectoryRecorder};
use crate::solvers::{FixedStepIntegrator, Method, NewtonSettings, OdeCallbacks, StepperConfig, TimeStepper};
use crate::traits::DifferentiableFunction;
use crate::transfer::{HostBuffers, TransferStrategy};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

/// Everything configurable about a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub method: Method,
    pub form: EquationForm,
    pub step_size: f64,
    pub transfer: TransferStrategy,
    /// Keep checkpoints so gradients can be computed after a solve.
    pub enable_adjoint: bool,
    /// Max distance between a step time and a requested output time.
    pub output_tolerance: f64,
    /// Return a shortened trajectory instead of failing when output times are missed.
    pub allow_partial_trajectory: bool,
    pub newton: NewtonSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            method: Method::default(),
            form: EquationForm::default(),
            step_size: 0.01,
            transfer: TransferStrategy::default(),
            enable_adjoint: true,
            output_tolerance: 1e-6,
            allow_partial_trajectory: false,
            newton: NewtonSettings::default(),
        }
    }
}

impl SessionSettings {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_form(mut self, form: EquationForm) -> Self {
        self.form = form;
        self
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferStrategy) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_output_tolerance(mut self, tolerance: f64) -> Self {
        self.output_tolerance = tolerance;
        self
    }

    /// Backward Euler on the implicit residual form.
    pub fn implicit(self) -> Self {
        self.with_method(Method::BackwardEuler)
            .with_form(EquationForm::ImplicitResidual)
    }

    pub fn stepper_config(&self) -> StepperConfig {
        StepperConfig {
            method: self.method,
            form: self.form,
            step_size: self.step_size,
            save_trajectory: self.enable_adjoint,
            newton: self.newton,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.stepper_config().validate()?;
        if !(self.output_tolerance > 0.0) {
            return Err(SolveError::Configuration(format!(
                "Output tolerance must be positive, got {}.",
                self.output_tolerance
            )));
        }
        if self.output_tolerance >= 0.5 * self.step_size {
            return Err(SolveError::Configuration(format!(
                "Output tolerance {} must be below half the step size {}.",
                self.output_tolerance, self.step_size
            )));
        }
        Ok(())
    }
}

/// Checks that `function` is usable: non-empty state, parameter vector
/// consistent with its declared length, and a trial evaluation at (t0, u0)
/// returning one output per state variable.
pub fn validate_function<F: DifferentiableFunction + ?Sized>(function: &F, t0: f64, u0: &[f64]) -> Result<()> {
    let n = function.dimension();
    if n == 0 {
        return Err(SolveError::InvalidFunction("State dimension is zero.".to_string()));
    }
    let params = function.parameters();
    if params.len() != function.num_parameters() {
        return Err(SolveError::InvalidFunction(format!(
            "Function reports {} parameters but exposes {}.",
            function.num_parameters(),
            params.len()
        )));
    }
    check_len("initial state", n, u0.len())?;
    let mut trial = vec![0.0; n];
    ForwardOperator::new(TransferStrategy::Shared)
        .evaluate(function, &params, t0, u0, &mut trial)
}

/// Callback bundle borrowed from a session for the duration of one stepper call.
struct SessionHandlers<'a, F: ?Sized> {
    function: &'a F,
    params: &'a [f64],
    cache: &'a mut EvaluationCache,
    forward: &'a mut ForwardOperator,
    jacobian: &'a mut JacobianShell,
    parameter_jacobian: &'a mut ParameterJacobianShell,
    recorder: Option<&'a mut TrajectoryRecorder>,
}

impl<F: DifferentiableFunction + ?Sized> OdeCallbacks for SessionHandlers<'_, F> {
    fn evaluate(&mut self, t: f64, u: &[f64], dudt: &mut [f64]) -> Result<()> {
        self.forward.evaluate(self.function, self.params, t, u, dudt)
    }

    fn evaluate_residual(&mut self, t: f64, u: &[f64], udot: &[f64], out: &mut [f64]) -> Result<()> {
        self.forward
            .evaluate_residual(self.function, self.params, t, u, udot, out)
    }

    fn prepare_jacobian(&mut self, t: f64, u: &[f64], shift: f64) -> Result<()> {
        self.cache.set_shifted(t, u, shift)
    }

    fn jacobian_action(&mut self, x: &[f64], out: &mut [f64]) -> Result<()> {
        self.jacobian
            .apply(self.cache, self.function, self.params, x, out)
    }

    fn jacobian_action_transpose(&mut self, x: &[f64], out: &mut [f64]) -> Result<()> {
        self.jacobian
            .apply_transpose(self.cache, self.function, self.params, x, out)
    }

    fn parameter_jacobian_transpose(&mut self, x: &[f64], out: &mut [f64]) -> Result<()> {
        self.parameter_jacobian
            .apply_transpose(self.cache, self.function, self.params, x, out)
    }

    fn on_step_accepted(&mut self, step: usize, t: f64, u: &[f64]) -> Result<()> {
        if let Some(recorder) = self.recorder.as_deref_mut() {
            recorder.on_step(step, t, u);
        }
        Ok(())
    }
}

/// Long-lived integration context for one differentiable function.
///
/// Owns the stepper, the linearization cache and the operator shells. It is
/// configured once and reused across sequential forward/backward pairs.
pub struct IntegrationSession<F: DifferentiableFunction> {
    function: F,
    params: Vec<f64>,
    settings: SessionSettings,
    stepper: Box<dyn TimeStepper>,
    cache: EvaluationCache,
    forward: ForwardOperator,
    jacobian: JacobianShell,
    parameter_jacobian: ParameterJacobianShell,
    recorder: TrajectoryRecorder,
    host: HostBuffers,
    solve_count: u64,
    output_times: Vec<f64>,
    /// θ installed during the most recent forward solve.
    solved_params: Vec<f64>,
}

impl<F: DifferentiableFunction> IntegrationSession<F> {
    pub fn new(function: F, settings: SessionSettings) -> Result<Self> {
        Self::with_stepper(function, settings, Box::new(FixedStepIntegrator::new()))
    }

    pub fn with_stepper(function: F, settings: SessionSettings, mut stepper: Box<dyn TimeStepper>) -> Result<Self> {
        settings.validate()?;
        let n = function.dimension();
        if n == 0 {
            return Err(SolveError::InvalidFunction("State dimension is zero.".to_string()));
        }
        let params = function.parameters();
        check_len("parameters", function.num_parameters(), params.len())?;
        stepper.configure(settings.stepper_config(), n, params.len())?;
        debug!(
            "Created session: n = {n}, p = {}, method = {}, form = {:?}, h = {}, transfer = {:?}",
            params.len(),
            settings.method,
            settings.form,
            settings.step_size,
            settings.transfer
        );
        Ok(Self {
            function,
            params,
            settings,
            stepper,
            cache: EvaluationCache::new(n),
            forward: ForwardOperator::new(settings.transfer),
            jacobian: JacobianShell::new(settings.form, settings.transfer),
            parameter_jacobian: ParameterJacobianShell::new(settings.form, settings.transfer),
            recorder: TrajectoryRecorder::new(settings.output_tolerance),
            host: HostBuffers::default(),
            solve_count: 0,
            output_times: Vec::new(),
            solved_params: Vec::new(),
        })
    }

    /// Applies new settings. Checkpoints of earlier solves are discarded.
    pub fn reconfigure(&mut self, settings: SessionSettings) -> Result<()> {
        settings.validate()?;
        self.stepper
            .configure(settings.stepper_config(), self.dimension(), self.params.len())?;
        self.settings = settings;
        self.cache.invalidate();
        self.forward = ForwardOperator::new(settings.transfer);
        self.jacobian = JacobianShell::new(settings.form, settings.transfer);
        self.parameter_jacobian = ParameterJacobianShell::new(settings.form, settings.transfer);
        self.recorder = TrajectoryRecorder::new(settings.output_tolerance);
        self.solve_count += 1;
        self.output_times.clear();
        debug!("Reconfigured session: {settings:?}");
        Ok(())
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn function(&self) -> &F {
        &self.function
    }

    pub fn dimension(&self) -> usize {
        self.cache.dimension()
    }

    pub fn num_parameters(&self) -> usize {
        self.params.len()
    }

    pub fn parameters(&self) -> &[f64] {
        &self.params
    }

    /// Installs θ into the function. The parameter shape is fixed.
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        check_len("parameters", self.params.len(), params.len())?;
        self.function.set_parameters(params)?;
        self.params.copy_from_slice(params);
        Ok(())
    }

    /// Number of forward solves (and reconfigurations) so far.
    pub fn solve_count(&self) -> u64 {
        self.solve_count
    }

    /// Output times of the most recent forward solve.
    pub fn output_times(&self) -> &[f64] {
        &self.output_times
    }

    /// Integrates from `u0` at `times[0]` and records the state at every time in `times`.
    pub fn odeint(&mut self, u0: &[f64], times: &[f64]) -> Result<Trajectory> {
        check_len("initial state", self.dimension(), u0.len())?;
        validate_output_times(times)?;

        self.solve_count += 1;
        self.output_times.clear();
        self.output_times.extend_from_slice(times);
        self.solved_params.clone_from(&self.params);
        self.cache.invalidate();
        self.recorder.reset(times);

        let t0 = times[0];
        let tf = times[times.len() - 1];
        if times.len() == 1 {
            self.recorder.on_step(0, t0, u0);
        } else {
            let mut handlers = SessionHandlers {
                function: &self.function,
                params: &self.params,
                cache: &mut self.cache,
                forward: &mut self.forward,
                jacobian: &mut self.jacobian,
                parameter_jacobian: &mut self.parameter_jacobian,
                recorder: Some(&mut self.recorder),
            };
            self.stepper.solve(&mut handlers, t0, tf, u0)?;
        }
        debug!(
            "Solve {} finished: {} steps, {} of {} outputs recorded",
            self.solve_count,
            self.stepper.steps_taken(),
            self.recorder.recorded(),
            self.recorder.requested()
        );

        if !self.recorder.is_complete() {
            let missed = self.recorder.first_missed().unwrap_or(f64::NAN);
            if !self.settings.allow_partial_trajectory {
                return Err(SolveError::MissedOutputTimes {
                    recorded: self.recorder.recorded(),
                    requested: self.recorder.requested(),
                    missed,
                });
            }
            warn!(
                "Step grid missed output time {missed}; returning {} of {} states",
                self.recorder.recorded(),
                self.recorder.requested()
            );
        }
        Ok(self.recorder.take())
    }

    /// Rewinds the stepper to the end of the last solve and seeds ∂L/∂u there.
    pub(crate) fn begin_adjoint(&mut self, state_adjoint: &[f64]) -> Result<()> {
        if !self.settings.enable_adjoint {
            return Err(SolveError::AdjointUnavailable(
                "Adjoint is disabled for this session.".to_string(),
            ));
        }
        let Some(&t_last) = self.output_times.last() else {
            return Err(SolveError::AdjointUnavailable(
                "No forward solve to differentiate.".to_string(),
            ));
        };
        if self.params != self.solved_params {
            return Err(SolveError::AdjointUnavailable(
                "Parameters changed since the last forward solve.".to_string(),
            ));
        }
        check_len("state adjoint", self.dimension(), state_adjoint.len())?;
        self.stepper.adjoint_reset()?;
        self.check_adjoint_time(t_last)?;
        let (lambda, _) = self.stepper.cost_gradients_mut();
        self.settings
            .transfer
            .write(lambda, &mut self.host.output, |buf| buf.copy_from_slice(state_adjoint));
        Ok(())
    }

    /// Runs the adjoint backwards over one output interval, from `t_from` down to `t_to`.
    pub fn adjoint_solve(&mut self, t_from: f64, t_to: f64) -> Result<()> {
        self.check_adjoint_time(t_from)?;
        let steps = interval_steps((t_from - t_to).abs(), self.settings.step_size);
        trace!("Adjoint interval [{t_to}, {t_from}]: {steps} steps");
        let mut handlers = SessionHandlers {
            function: &self.function,
            params: &self.params,
            cache: &mut self.cache,
            forward: &mut self.forward,
            jacobian: &mut self.jacobian,
            parameter_jacobian: &mut self.parameter_jacobian,
            recorder: None,
        };
        self.stepper.adjoint_solve(&mut handlers, steps)?;
        self.check_adjoint_time(t_to)
    }

    /// Adds ∂L/∂u at the current adjoint time to the stepper's state adjoint.
    pub(crate) fn add_forcing(&mut self, forcing: &[f64]) -> Result<()> {
        check_len("adjoint forcing", self.dimension(), forcing.len())?;
        let (lambda, _) = self.stepper.cost_gradients_mut();
        self.settings.transfer.write(lambda, &mut self.host.output, |buf| {
            for (l, f) in buf.iter_mut().zip(forcing) {
                *l += f;
            }
        });
        Ok(())
    }

    /// Current (state adjoint, parameter adjoint).
    pub fn cost_gradients(&self) -> (&[f64], &[f64]) {
        self.stepper.cost_gradients()
    }

    fn check_adjoint_time(&self, expected: f64) -> Result<()> {
        let actual = self.stepper.adjoint_time();
        if (actual - expected).abs() > self.settings.output_tolerance {
            return Err(SolveError::AdjointTimeMismatch { expected, actual });
        }
        Ok(())
    }
}

fn validate_output_times(times: &[f64]) -> Result<()> {
    if times.is_empty() {
        return Err(SolveError::InvalidOutputTimes("No output times given.".to_string()));
    }
    if let Some(t) = times.iter().find(|t| !t.is_finite()) {
        return Err(SolveError::InvalidOutputTimes(format!("Non-finite output time {t}.")));
    }
    if let Some(w) = times.windows(2).find(|w| w[1] <= w[0]) {
        return Err(SolveError::InvalidOutputTimes(format!(
            "Output times must be strictly ascending ({} then {}).",
            w[0], w[1]
        )));
    }
    Ok(())
}

/// Steps covering an output interval of length `dt`: the nearest integer for
/// grid-aligned intervals, otherwise the ceiling (the final, shortened step).
fn interval_steps(dt: f64, h: f64) -> usize {
    let exact = dt / h;
    let nearest = exact.round();
    if (exact - nearest).abs() < 1e-6 {
        nearest as usize
    } else {
        exact.ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::EquationSystem;

    fn decay(k: f64) -> EquationSystem {
        EquationSystem::compile(&["u".to_string()], &["k".to_string()], &["-k * u"], vec![k]).unwrap()
    }

    #[test]
    fn settings_validation() {
        assert!(SessionSettings::default().validate().is_ok());
        assert!(SessionSettings::default().with_step_size(0.0).validate().is_err());
        assert!(SessionSettings::default()
            .with_step_size(1e-6)
            .validate()
            .is_err());
        assert!(SessionSettings::default()
            .with_form(EquationForm::ImplicitResidual)
            .validate()
            .is_err());
        assert!(SessionSettings::default().implicit().validate().is_ok());
        assert!(SessionSettings::default()
            .with_output_tolerance(0.0)
            .validate()
            .is_err());
        assert!(SessionSettings::default()
            .with_output_tolerance(0.006)
            .validate()
            .is_err());
        assert!(SessionSettings::default()
            .with_output_tolerance(1e-4)
            .validate()
            .is_ok());
    }

    #[test]
    fn output_times_must_ascend() {
        let mut session = IntegrationSession::new(decay(1.0), SessionSettings::default()).unwrap();
        let cases: [&[f64]; 4] = [&[], &[0.0, 0.0], &[0.0, f64::NAN], &[1.0, 0.5]];
        for times in cases {
            assert!(matches!(
                session.odeint(&[1.0], times),
                Err(SolveError::InvalidOutputTimes(_))
            ));
        }
    }

    #[test]
    fn single_output_time_returns_initial_state() {
        let mut session = IntegrationSession::new(decay(1.0), SessionSettings::default()).unwrap();
        let traj = session.odeint(&[2.0], &[0.5]).unwrap();
        assert_eq!(traj.states, vec![vec![2.0]]);
    }

    #[test]
    fn missed_output_times_fail_unless_partial_allowed() {
        let settings = SessionSettings::default()
            .with_method(Method::Rk4)
            .with_step_size(0.1);
        let mut session = IntegrationSession::new(decay(1.0), settings).unwrap();
        let err = session.odeint(&[1.0], &[0.0, 0.15, 0.3]).unwrap_err();
        assert!(matches!(
            err,
            SolveError::MissedOutputTimes {
                recorded: 2,
                requested: 3,
                ..
            }
        ));

        let mut settings = settings;
        settings.allow_partial_trajectory = true;
        session.reconfigure(settings).unwrap();
        let traj = session.odeint(&[1.0], &[0.0, 0.15, 0.3]).unwrap();
        assert_eq!(traj.len(), 2);
    }

    #[test]
    fn solve_count_advances() {
        let mut session = IntegrationSession::new(decay(1.0), SessionSettings::default()).unwrap();
        session.odeint(&[1.0], &[0.0, 0.1]).unwrap();
        session.odeint(&[1.0], &[0.0, 0.1]).unwrap();
        assert_eq!(session.solve_count(), 2);
        assert_eq!(session.output_times(), &[0.0, 0.1]);
    }

    #[test]
    fn invalid_function_is_rejected() {
        let f = decay(1.0);
        assert!(validate_function(&f, 0.0, &[1.0]).is_ok());
        assert!(matches!(
            validate_function(&f, 0.0, &[1.0, 2.0]),
            Err(SolveError::DimensionMismatch { .. })
        ));
        let empty = EquationSystem::new(Vec::new(), Vec::new());
        assert!(matches!(
            IntegrationSession::new(empty, SessionSettings::default()),
            Err(SolveError::InvalidFunction(_))
        ));
    }

    #[test]
    fn interval_steps_cover_shortened_final_step() {
        assert_eq!(interval_steps(1.0, 0.1), 10);
        assert_eq!(interval_steps(0.3, 0.1), 3);
        assert_eq!(interval_steps(0.24, 0.1), 3);
    }
}
