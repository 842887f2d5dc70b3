use crate::error::{Result, SolveError};
use crate::operators::EquationForm;
use anyhow::{anyhow, Context};
use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Explicit Runge-Kutta coefficients. Row `i` of `a` holds the `i` entries
/// a_ij, j < i.
#[derive(Debug)]
pub struct ButcherTableau {
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
    pub c: &'static [f64],
}

impl ButcherTableau {
    pub fn stages(&self) -> usize {
        self.b.len()
    }
}

static EULER: ButcherTableau = ButcherTableau {
    a: &[&[]],
    b: &[1.0],
    c: &[0.0],
};

static HEUN: ButcherTableau = ButcherTableau {
    a: &[&[], &[1.0]],
    b: &[0.5, 0.5],
    c: &[0.0, 1.0],
};

static RK4: ButcherTableau = ButcherTableau {
    a: &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
    c: &[0.0, 0.5, 0.5, 1.0],
};

// Dormand-Prince 5(4) without the FSAL stage; the embedded estimate is unused.
static DOPRI5: ButcherTableau = ButcherTableau {
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0],
};

/// Integration method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Euler,
    #[serde(alias = "midpoint")]
    Heun,
    Rk4,
    #[default]
    Dopri5Fixed,
    /// Implicit; requires [`EquationForm::ImplicitResidual`].
    #[serde(rename = "beuler")]
    BackwardEuler,
}

impl Method {
    pub fn is_implicit(self) -> bool {
        matches!(self, Method::BackwardEuler)
    }

    pub fn tableau(self) -> Option<&'static ButcherTableau> {
        match self {
            Method::Euler => Some(&EULER),
            Method::Heun => Some(&HEUN),
            Method::Rk4 => Some(&RK4),
            Method::Dopri5Fixed => Some(&DOPRI5),
            Method::BackwardEuler => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::Euler => "euler",
            Method::Heun => "heun",
            Method::Rk4 => "rk4",
            Method::Dopri5Fixed => "dopri5_fixed",
            Method::BackwardEuler => "beuler",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = SolveError;

    /// Accepts the canonical names plus the classic solver-library aliases.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euler" | "1fe" => Ok(Method::Euler),
            "heun" | "midpoint" | "2a" => Ok(Method::Heun),
            "rk4" | "4" => Ok(Method::Rk4),
            "dopri5_fixed" | "dopri5" | "5dp" => Ok(Method::Dopri5Fixed),
            "beuler" | "backward_euler" => Ok(Method::BackwardEuler),
            other => Err(SolveError::Configuration(format!(
                "Unknown integration method '{other}'."
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

impl NewtonSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(SolveError::Configuration(
                "max_steps must be greater than zero.".to_string(),
            ));
        }
        if !(self.damping > 0.0) {
            return Err(SolveError::Configuration("damping must be positive.".to_string()));
        }
        if !(self.tolerance > 0.0) {
            return Err(SolveError::Configuration("tolerance must be positive.".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepperConfig {
    pub method: Method,
    pub form: EquationForm,
    pub step_size: f64,
    /// Keep stage checkpoints for the adjoint pass.
    pub save_trajectory: bool,
    pub newton: NewtonSettings,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            method: Method::default(),
            form: EquationForm::default(),
            step_size: 0.01,
            save_trajectory: true,
            newton: NewtonSettings::default(),
        }
    }
}

impl StepperConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size > 0.0) || !self.step_size.is_finite() {
            return Err(SolveError::Configuration(format!(
                "Step size must be positive and finite, got {}.",
                self.step_size
            )));
        }
        if self.method.is_implicit() != self.form.is_implicit() {
            return Err(SolveError::Configuration(format!(
                "Method '{}' cannot integrate the {:?} form.",
                self.method, self.form
            )));
        }
        if self.method.is_implicit() {
            self.newton.validate()?;
        }
        Ok(())
    }
}

/// Capabilities the stepper calls back into. Calls are synchronous and never
/// overlap.
pub trait OdeCallbacks {
    /// dudt = f(t, u)
    fn evaluate(&mut self, t: f64, u: &[f64], dudt: &mut [f64]) -> Result<()>;

    /// out = F(t, u, u̇) = u̇ − f(t, u)
    fn evaluate_residual(&mut self, t: f64, u: &[f64], udot: &[f64], out: &mut [f64]) -> Result<()>;

    /// Moves the linearization point used by the following Jacobian actions.
    fn prepare_jacobian(&mut self, t: f64, u: &[f64], shift: f64) -> Result<()>;

    fn jacobian_action(&mut self, x: &[f64], out: &mut [f64]) -> Result<()>;

    fn jacobian_action_transpose(&mut self, x: &[f64], out: &mut [f64]) -> Result<()>;

    fn parameter_jacobian_transpose(&mut self, x: &[f64], out: &mut [f64]) -> Result<()>;

    /// Step monitor; called for step 0 with the initial state and after every step.
    fn on_step_accepted(&mut self, step: usize, t: f64, u: &[f64]) -> Result<()>;
}

/// Forward integrator with a discrete adjoint over its own checkpoints.
///
/// Cost gradients are the pair (λ, μ): λ holds ∂L/∂u at the current adjoint
/// time and μ accumulates ∂L/∂θ.
pub trait TimeStepper {
    fn configure(&mut self, config: StepperConfig, dimension: usize, num_parameters: usize) -> Result<()>;

    /// Integrates from `t0` to exactly `tf` and returns the final state.
    fn solve(&mut self, callbacks: &mut dyn OdeCallbacks, t0: f64, tf: f64, u0: &[f64]) -> Result<Vec<f64>>;

    fn steps_taken(&self) -> usize;

    /// Rewinds to the end of the last solve and zeroes both cost gradients.
    fn adjoint_reset(&mut self) -> Result<()>;

    /// Runs `steps` adjoint steps backwards from the current adjoint time.
    fn adjoint_solve(&mut self, callbacks: &mut dyn OdeCallbacks, steps: usize) -> Result<()>;

    fn adjoint_time(&self) -> f64;

    fn cost_gradients(&self) -> (&[f64], &[f64]);

    fn cost_gradients_mut(&mut self) -> (&mut [f64], &mut [f64]);
}

#[derive(Debug, Clone)]
struct Checkpoint {
    /// Start time of the step.
    time: f64,
    step_size: f64,
    /// Explicit methods: stage states Y_i. Backward Euler: the step's result.
    stages: Vec<Vec<f64>>,
}

/// Fixed-step integrator covering every [`Method`].
///
/// The step grid is t0 + k·h; the last step is shortened to land exactly on
/// the final time.
pub struct FixedStepIntegrator {
    config: StepperConfig,
    dimension: usize,
    num_parameters: usize,
    configured: bool,
    derivatives: Vec<Vec<f64>>,
    checkpoints: Vec<Checkpoint>,
    cursor: usize,
    steps_taken: usize,
    final_time: f64,
    adjoint_time: f64,
    lambda: Vec<f64>,
    mu: Vec<f64>,
}

impl Default for FixedStepIntegrator {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedStepIntegrator {
    pub fn new() -> Self {
        Self {
            config: StepperConfig::default(),
            dimension: 0,
            num_parameters: 0,
            configured: false,
            derivatives: Vec::new(),
            checkpoints: Vec::new(),
            cursor: 0,
            steps_taken: 0,
            final_time: 0.0,
            adjoint_time: 0.0,
            lambda: Vec::new(),
            mu: Vec::new(),
        }
    }

    fn explicit_step(
        &mut self,
        callbacks: &mut dyn OdeCallbacks,
        tableau: &ButcherTableau,
        t: f64,
        h: f64,
        u: &mut [f64],
    ) -> Result<Vec<Vec<f64>>> {
        let stages = tableau.stages();
        let mut states = Vec::with_capacity(stages);
        for i in 0..stages {
            let mut y = u.to_vec();
            for (j, a_ij) in tableau.a[i].iter().enumerate() {
                if *a_ij != 0.0 {
                    for (yk, kk) in y.iter_mut().zip(&self.derivatives[j]) {
                        *yk += h * a_ij * kk;
                    }
                }
            }
            callbacks.evaluate(t + tableau.c[i] * h, &y, &mut self.derivatives[i])?;
            states.push(y);
        }
        for (i, b_i) in tableau.b.iter().enumerate() {
            for (uk, kk) in u.iter_mut().zip(&self.derivatives[i]) {
                *uk += h * b_i * kk;
            }
        }
        Ok(states)
    }
}

impl TimeStepper for FixedStepIntegrator {
    fn configure(&mut self, config: StepperConfig, dimension: usize, num_parameters: usize) -> Result<()> {
        config.validate()?;
        if dimension == 0 {
            return Err(SolveError::Configuration(
                "State dimension must be positive.".to_string(),
            ));
        }
        let stages = config.method.tableau().map_or(1, ButcherTableau::stages);
        self.config = config;
        self.dimension = dimension;
        self.num_parameters = num_parameters;
        self.derivatives = vec![vec![0.0; dimension]; stages];
        self.checkpoints.clear();
        self.cursor = 0;
        self.steps_taken = 0;
        self.lambda = vec![0.0; dimension];
        self.mu = vec![0.0; num_parameters];
        self.configured = true;
        Ok(())
    }

    fn solve(&mut self, callbacks: &mut dyn OdeCallbacks, t0: f64, tf: f64, u0: &[f64]) -> Result<Vec<f64>> {
        if !self.configured {
            return Err(SolveError::Configuration(
                "Time stepper used before configure.".to_string(),
            ));
        }
        if u0.len() != self.dimension {
            return Err(SolveError::DimensionMismatch {
                what: "initial state",
                expected: self.dimension,
                actual: u0.len(),
            });
        }
        if !(tf >= t0) {
            return Err(SolveError::InvalidOutputTimes(format!(
                "Final time {tf} precedes initial time {t0}."
            )));
        }

        let h = self.config.step_size;
        let steps = ((tf - t0) / h - 1e-9).ceil().max(0.0) as usize;
        debug!(
            "Integrating {} steps of {} from t = {t0} to t = {tf} (h = {h})",
            steps, self.config.method
        );

        self.checkpoints.clear();
        self.cursor = 0;
        self.steps_taken = 0;
        self.final_time = t0;
        self.adjoint_time = t0;

        let mut u = u0.to_vec();
        callbacks.on_step_accepted(0, t0, &u)?;
        for k in 0..steps {
            let t = t0 + k as f64 * h;
            let last = k + 1 == steps;
            let t_next = if last { tf } else { t0 + (k + 1) as f64 * h };
            let dt = t_next - t;

            let stages = match self.config.method.tableau() {
                Some(tableau) => self.explicit_step(callbacks, tableau, t, dt, &mut u)?,
                None => {
                    let iterations =
                        backward_euler_step(callbacks, &self.config.newton, t_next, dt, &mut u)?;
                    trace!("Backward Euler step {k} converged in {iterations} Newton iterations");
                    vec![u.clone()]
                }
            };
            if self.config.save_trajectory {
                self.checkpoints.push(Checkpoint {
                    time: t,
                    step_size: dt,
                    stages,
                });
            }
            self.steps_taken = k + 1;
            callbacks.on_step_accepted(k + 1, t_next, &u)?;
        }
        self.final_time = tf;
        self.adjoint_time = tf;
        self.cursor = self.checkpoints.len();
        Ok(u)
    }

    fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    fn adjoint_reset(&mut self) -> Result<()> {
        if !self.config.save_trajectory {
            return Err(SolveError::AdjointUnavailable(
                "Checkpoints were not saved during the forward solve.".to_string(),
            ));
        }
        if self.checkpoints.len() != self.steps_taken {
            return Err(SolveError::AdjointUnavailable(
                "No complete forward solve to differentiate.".to_string(),
            ));
        }
        self.cursor = self.checkpoints.len();
        self.adjoint_time = self.final_time;
        self.lambda.iter_mut().for_each(|v| *v = 0.0);
        self.mu.iter_mut().for_each(|v| *v = 0.0);
        Ok(())
    }

    fn adjoint_solve(&mut self, callbacks: &mut dyn OdeCallbacks, steps: usize) -> Result<()> {
        if !self.config.save_trajectory {
            return Err(SolveError::AdjointUnavailable(
                "Checkpoints were not saved during the forward solve.".to_string(),
            ));
        }
        if steps > self.cursor {
            return Err(SolveError::AdjointUnavailable(format!(
                "Requested {steps} adjoint steps but only {} checkpoints remain.",
                self.cursor
            )));
        }
        for _ in 0..steps {
            self.cursor -= 1;
            let checkpoint = &self.checkpoints[self.cursor];
            match self.config.method.tableau() {
                Some(tableau) => rk_adjoint_step(
                    callbacks,
                    tableau,
                    checkpoint,
                    &mut self.lambda,
                    &mut self.mu,
                )?,
                None => backward_euler_adjoint_step(
                    callbacks,
                    checkpoint,
                    &mut self.lambda,
                    &mut self.mu,
                )?,
            }
            self.adjoint_time = checkpoint.time;
        }
        Ok(())
    }

    fn adjoint_time(&self) -> f64 {
        self.adjoint_time
    }

    fn cost_gradients(&self) -> (&[f64], &[f64]) {
        (&self.lambda, &self.mu)
    }

    fn cost_gradients_mut(&mut self) -> (&mut [f64], &mut [f64]) {
        (&mut self.lambda, &mut self.mu)
    }
}

/// Discrete adjoint of one explicit RK step:
/// ψ_i = h·b_i·λ + h·Σ_{j>i} a_ji·φ_j, φ_i = Jᵀ(Y_i)·ψ_i.
fn rk_adjoint_step(
    callbacks: &mut dyn OdeCallbacks,
    tableau: &ButcherTableau,
    checkpoint: &Checkpoint,
    lambda: &mut [f64],
    mu: &mut [f64],
) -> Result<()> {
    let stages = tableau.stages();
    let h = checkpoint.step_size;
    let mut phi = vec![vec![0.0; lambda.len()]; stages];
    let mut psi = vec![0.0; lambda.len()];
    let mut dmu = vec![0.0; mu.len()];

    for i in (0..stages).rev() {
        for (k, p) in psi.iter_mut().enumerate() {
            let mut acc = h * tableau.b[i] * lambda[k];
            for j in i + 1..stages {
                acc += h * tableau.a[j][i] * phi[j][k];
            }
            *p = acc;
        }
        if psi.iter().all(|v| *v == 0.0) {
            continue;
        }
        callbacks.prepare_jacobian(
            checkpoint.time + tableau.c[i] * h,
            &checkpoint.stages[i],
            0.0,
        )?;
        callbacks.jacobian_action_transpose(&psi, &mut phi[i])?;
        callbacks.parameter_jacobian_transpose(&psi, &mut dmu)?;
        for (m, d) in mu.iter_mut().zip(&dmu) {
            *m += d;
        }
    }

    for stage in &phi {
        for (l, p) in lambda.iter_mut().zip(stage) {
            *l += p;
        }
    }
    Ok(())
}

/// Newton iteration on u − u_prev − h·f(t_next, u) = 0 posed as the residual
/// F(t_next, u, (u − u_prev)/h). Returns the iterations used.
fn backward_euler_step(
    callbacks: &mut dyn OdeCallbacks,
    newton: &NewtonSettings,
    t_next: f64,
    h: f64,
    u: &mut [f64],
) -> Result<usize> {
    let n = u.len();
    let shift = 1.0 / h;
    let previous = u.to_vec();
    let mut udot = vec![0.0; n];
    let mut residual = vec![0.0; n];

    for iteration in 1..=newton.max_steps {
        for ((d, x), x0) in udot.iter_mut().zip(u.iter()).zip(&previous) {
            *d = (x - x0) * shift;
        }
        callbacks.evaluate_residual(t_next, u, &udot, &mut residual)?;
        callbacks.prepare_jacobian(t_next, u, shift)?;
        let matrix = assemble(n, |x, out| callbacks.jacobian_action(x, out))?;
        let rhs: Vec<f64> = residual.iter().map(|r| -r).collect();
        let delta = solve_linear_system(matrix, &rhs)
            .with_context(|| format!("Backward Euler Newton iteration {iteration} at t = {t_next}"))?;

        let mut norm: f64 = 0.0;
        for (x, d) in u.iter_mut().zip(&delta) {
            *x += newton.damping * d;
            norm = norm.max(d.abs());
        }
        if norm < newton.tolerance {
            return Ok(iteration);
        }
    }
    Err(anyhow!(
        "Backward Euler Newton iteration did not converge in {} steps at t = {t_next}.",
        newton.max_steps
    )
    .into())
}

/// Discrete adjoint of one backward Euler step: solve (shift·I − J)ᵀ w = λ,
/// then λ ← shift·w and μ −= F_θᵀ w.
fn backward_euler_adjoint_step(
    callbacks: &mut dyn OdeCallbacks,
    checkpoint: &Checkpoint,
    lambda: &mut [f64],
    mu: &mut [f64],
) -> Result<()> {
    let n = lambda.len();
    let h = checkpoint.step_size;
    let shift = 1.0 / h;
    callbacks.prepare_jacobian(checkpoint.time + h, &checkpoint.stages[0], shift)?;
    let transposed = assemble(n, |x, out| callbacks.jacobian_action_transpose(x, out))?;
    let w = solve_linear_system(transposed, lambda)
        .with_context(|| format!("Backward Euler adjoint step at t = {}", checkpoint.time))?;

    let mut dmu = vec![0.0; mu.len()];
    callbacks.parameter_jacobian_transpose(&w, &mut dmu)?;
    for (m, d) in mu.iter_mut().zip(&dmu) {
        *m -= d;
    }
    for (l, wk) in lambda.iter_mut().zip(&w) {
        *l = shift * wk;
    }
    Ok(())
}

/// Dense matrix whose j-th column is action(e_j).
fn assemble(
    n: usize,
    mut action: impl FnMut(&[f64], &mut [f64]) -> Result<()>,
) -> Result<DMatrix<f64>> {
    let mut matrix = DMatrix::zeros(n, n);
    let mut unit = vec![0.0; n];
    let mut column = vec![0.0; n];
    for j in 0..n {
        unit[j] = 1.0;
        action(&unit, &mut column)?;
        unit[j] = 0.0;
        matrix.set_column(j, &DVector::from_column_slice(&column));
    }
    Ok(matrix)
}

fn solve_linear_system(matrix: DMatrix<f64>, rhs: &[f64]) -> anyhow::Result<Vec<f64>> {
    let rhs = DVector::from_column_slice(rhs);
    matrix
        .lu()
        .solve(&rhs)
        .map(|v| v.iter().cloned().collect())
        .ok_or_else(|| anyhow!("Iteration matrix is singular."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// u̇ = −k·u with the single parameter k.
    struct Decay {
        k: f64,
        implicit: bool,
        point: Vec<f64>,
        shift: f64,
        monitored: Vec<(usize, f64)>,
    }

    impl Decay {
        fn new(k: f64, implicit: bool) -> Self {
            Self {
                k,
                implicit,
                point: Vec::new(),
                shift: 0.0,
                monitored: Vec::new(),
            }
        }

        fn jacobian(&self, x: &[f64], out: &mut [f64]) {
            for (o, xi) in out.iter_mut().zip(x) {
                let jx = -self.k * xi;
                *o = if self.implicit { self.shift * xi - jx } else { jx };
            }
        }
    }

    impl OdeCallbacks for Decay {
        fn evaluate(&mut self, _t: f64, u: &[f64], dudt: &mut [f64]) -> Result<()> {
            for (d, x) in dudt.iter_mut().zip(u) {
                *d = -self.k * x;
            }
            Ok(())
        }

        fn evaluate_residual(&mut self, _t: f64, u: &[f64], udot: &[f64], out: &mut [f64]) -> Result<()> {
            for ((o, x), xd) in out.iter_mut().zip(u).zip(udot) {
                *o = xd + self.k * x;
            }
            Ok(())
        }

        fn prepare_jacobian(&mut self, _t: f64, u: &[f64], shift: f64) -> Result<()> {
            self.point = u.to_vec();
            self.shift = shift;
            Ok(())
        }

        fn jacobian_action(&mut self, x: &[f64], out: &mut [f64]) -> Result<()> {
            self.jacobian(x, out);
            Ok(())
        }

        fn jacobian_action_transpose(&mut self, x: &[f64], out: &mut [f64]) -> Result<()> {
            self.jacobian(x, out);
            Ok(())
        }

        fn parameter_jacobian_transpose(&mut self, x: &[f64], out: &mut [f64]) -> Result<()> {
            let dot: f64 = self.point.iter().zip(x).map(|(u, x)| -u * x).sum();
            out[0] = if self.implicit { -dot } else { dot };
            Ok(())
        }

        fn on_step_accepted(&mut self, step: usize, t: f64, _u: &[f64]) -> Result<()> {
            self.monitored.push((step, t));
            Ok(())
        }
    }

    fn stepper(method: Method, form: EquationForm, h: f64) -> FixedStepIntegrator {
        let mut stepper = FixedStepIntegrator::new();
        stepper
            .configure(
                StepperConfig {
                    method,
                    form,
                    step_size: h,
                    ..StepperConfig::default()
                },
                1,
                1,
            )
            .unwrap();
        stepper
    }

    #[test]
    fn explicit_methods_converge_to_exponential() {
        let cases = [
            (Method::Euler, 5e-2),
            (Method::Heun, 1e-3),
            (Method::Rk4, 1e-6),
            (Method::Dopri5Fixed, 1e-7),
        ];
        for (method, tol) in cases {
            let mut s = stepper(method, EquationForm::Explicit, 0.1);
            let mut f = Decay::new(1.0, false);
            let u = s.solve(&mut f, 0.0, 1.0, &[1.0]).unwrap();
            assert!(
                (u[0] - (-1.0f64).exp()).abs() < tol,
                "{method}: {} vs {}",
                u[0],
                (-1.0f64).exp()
            );
        }
    }

    #[test]
    fn final_step_is_shortened_onto_final_time() {
        let mut s = stepper(Method::Rk4, EquationForm::Explicit, 0.1);
        let mut f = Decay::new(1.0, false);
        s.solve(&mut f, 0.0, 0.25, &[1.0]).unwrap();
        assert_eq!(s.steps_taken(), 3);
        assert_eq!(f.monitored.first(), Some(&(0, 0.0)));
        assert_eq!(f.monitored.last(), Some(&(3, 0.25)));
    }

    #[test]
    fn euler_adjoint_is_exact_discrete_derivative() {
        let (h, k, u0, steps) = (0.1, 1.0, 0.5, 20);
        let mut s = stepper(Method::Euler, EquationForm::Explicit, h);
        let mut f = Decay::new(k, false);
        s.solve(&mut f, 0.0, 2.0, &[u0]).unwrap();
        s.adjoint_reset().unwrap();
        s.cost_gradients_mut().0[0] = 1.0;
        s.adjoint_solve(&mut f, steps).unwrap();

        let (lambda, mu) = s.cost_gradients();
        let growth: f64 = 1.0 - h * k;
        assert_relative_eq!(lambda[0], growth.powi(steps as i32), max_relative = 1e-12);
        let dk = -(steps as f64) * h * u0 * growth.powi(steps as i32 - 1);
        assert_relative_eq!(mu[0], dk, max_relative = 1e-10);
        assert_relative_eq!(s.adjoint_time(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn backward_euler_adjoint_is_exact_discrete_derivative() {
        let (h, k, u0, steps) = (0.1, 2.0, 1.5, 10);
        let mut s = stepper(Method::BackwardEuler, EquationForm::ImplicitResidual, h);
        let mut f = Decay::new(k, true);
        let u = s.solve(&mut f, 0.0, 1.0, &[u0]).unwrap();
        let growth: f64 = 1.0 / (1.0 + h * k);
        assert_relative_eq!(u[0], u0 * growth.powi(steps), max_relative = 1e-9);

        s.adjoint_reset().unwrap();
        s.cost_gradients_mut().0[0] = 1.0;
        s.adjoint_solve(&mut f, steps as usize).unwrap();
        let (lambda, mu) = s.cost_gradients();
        assert_relative_eq!(lambda[0], growth.powi(steps), max_relative = 1e-9);
        let dk = -(steps as f64) * h * u0 * growth.powi(steps + 1);
        assert_relative_eq!(mu[0], dk, max_relative = 1e-7);
    }

    #[test]
    fn adjoint_cannot_run_past_the_first_checkpoint() {
        let mut s = stepper(Method::Euler, EquationForm::Explicit, 0.1);
        let mut f = Decay::new(1.0, false);
        s.solve(&mut f, 0.0, 0.3, &[1.0]).unwrap();
        s.adjoint_reset().unwrap();
        let err = s.adjoint_solve(&mut f, 4).unwrap_err();
        assert!(matches!(err, SolveError::AdjointUnavailable(_)));
    }

    #[test]
    fn adjoint_requires_saved_checkpoints() {
        let mut s = FixedStepIntegrator::new();
        s.configure(
            StepperConfig {
                method: Method::Euler,
                save_trajectory: false,
                ..StepperConfig::default()
            },
            1,
            1,
        )
        .unwrap();
        let mut f = Decay::new(1.0, false);
        s.solve(&mut f, 0.0, 0.1, &[1.0]).unwrap();
        assert!(matches!(
            s.adjoint_reset(),
            Err(SolveError::AdjointUnavailable(_))
        ));
    }

    #[test]
    fn method_and_form_must_agree() {
        let mut s = FixedStepIntegrator::new();
        let config = StepperConfig {
            method: Method::Rk4,
            form: EquationForm::ImplicitResidual,
            ..StepperConfig::default()
        };
        assert!(matches!(
            s.configure(config, 1, 0),
            Err(SolveError::Configuration(_))
        ));
        let config = StepperConfig {
            method: Method::BackwardEuler,
            form: EquationForm::Explicit,
            ..StepperConfig::default()
        };
        assert!(s.configure(config, 1, 0).is_err());
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("midpoint".parse::<Method>().unwrap(), Method::Heun);
        assert_eq!("5dp".parse::<Method>().unwrap(), Method::Dopri5Fixed);
        assert_eq!("BEULER".parse::<Method>().unwrap(), Method::BackwardEuler);
        assert_eq!(Method::Rk4.to_string(), "rk4");
        assert!("tsit5".parse::<Method>().is_err());
    }

    #[test]
    fn tableau_rows_are_consistent() {
        for method in [Method::Euler, Method::Heun, Method::Rk4, Method::Dopri5Fixed] {
            let tableau = method.tableau().unwrap();
            assert_relative_eq!(tableau.b.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
            for (i, row) in tableau.a.iter().enumerate() {
                assert_eq!(row.len(), i);
                assert_relative_eq!(row.iter().sum::<f64>(), tableau.c[i], epsilon = 1e-14);
            }
        }
    }
}
