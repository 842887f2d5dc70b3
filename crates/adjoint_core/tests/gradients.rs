use adjoint_core::autodiff::Tape;
use adjoint_core::equation_engine::EquationSystem;
use adjoint_core::network::Mlp;
use adjoint_core::traits::DifferentiableFunction;
use adjoint_core::{
    odeint_adjoint, AdjointOrchestrator, AdjointState, EquationForm, IntegrationSession, Method,
    SessionSettings, TransferStrategy,
};
use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::Rc;

fn system(vars: &[&str], params: &[&str], eqs: &[&str], values: Vec<f64>) -> EquationSystem {
    let vars: Vec<String> = vars.iter().map(|s| s.to_string()).collect();
    let params: Vec<String> = params.iter().map(|s| s.to_string()).collect();
    EquationSystem::compile(&vars, &params, eqs, values).unwrap()
}

fn decay() -> EquationSystem {
    system(&["u"], &[], &["-u"], vec![])
}

fn lotka_volterra() -> EquationSystem {
    system(
        &["x", "y"],
        &["a", "b", "c", "d"],
        &["a * x - b * x * y", "c * x * y - d * y"],
        vec![1.0, 0.5, 0.5, 1.0],
    )
}

/// L = Σ_i Σ_k w_ik · u_k(t_i), so ∂L/∂u(t_i) = w_i.
fn weighted_loss(states: &[Vec<f64>], weights: &[Vec<f64>]) -> f64 {
    states
        .iter()
        .zip(weights)
        .map(|(u, w)| u.iter().zip(w).map(|(a, b)| a * b).sum::<f64>())
        .sum()
}

fn adjoint<F: DifferentiableFunction>(
    session: &mut IntegrationSession<F>,
    u0: &[f64],
    times: &[f64],
    weights: &[Vec<f64>],
) -> AdjointState {
    session.odeint(u0, times).unwrap();
    AdjointOrchestrator::new(session).run(times, weights).unwrap()
}

fn assert_matches_finite_differences<F: DifferentiableFunction>(
    session: &mut IntegrationSession<F>,
    u0: &[f64],
    times: &[f64],
    weights: &[Vec<f64>],
    tolerance: f64,
) {
    let grads = adjoint(session, u0, times, weights);
    let theta = session.parameters().to_vec();
    let eps = 1e-5;
    let loss_at = |session: &mut IntegrationSession<F>, u: &[f64], p: &[f64]| {
        session.set_parameters(p).unwrap();
        let traj = session.odeint(u, times).unwrap();
        weighted_loss(&traj.states, weights)
    };

    for j in 0..theta.len() {
        let mut plus = theta.clone();
        let mut minus = theta.clone();
        plus[j] += eps;
        minus[j] -= eps;
        let fd = (loss_at(session, u0, &plus) - loss_at(session, u0, &minus)) / (2.0 * eps);
        assert!(
            (grads.parameter_adjoint[j] - fd).abs() < tolerance,
            "dL/dθ[{j}]: adjoint {} vs finite difference {fd}",
            grads.parameter_adjoint[j]
        );
    }
    for k in 0..u0.len() {
        let mut plus = u0.to_vec();
        let mut minus = u0.to_vec();
        plus[k] += eps;
        minus[k] -= eps;
        let fd = (loss_at(session, &plus, &theta) - loss_at(session, &minus, &theta)) / (2.0 * eps);
        assert!(
            (grads.state_adjoint[k] - fd).abs() < tolerance,
            "dL/du0[{k}]: adjoint {} vs finite difference {fd}",
            grads.state_adjoint[k]
        );
    }
    session.set_parameters(&theta).unwrap();
}

#[test]
fn exponential_decay_euler_end_to_end() {
    let settings = SessionSettings::default()
        .with_method(Method::Euler)
        .with_step_size(0.1);
    let mut session = IntegrationSession::new(decay(), settings).unwrap();
    let times = [0.0, 1.0, 2.0];
    let u0 = 0.5;
    let traj = session.odeint(&[u0], &times).unwrap();
    assert_eq!(traj.len(), 3);
    for (t, u) in times.iter().zip(&traj.states) {
        assert!((u[0] - u0 * (-t).exp()).abs() < 1e-2);
    }

    let grads = AdjointOrchestrator::new(&mut session)
        .run(&times, &[vec![0.0], vec![0.0], vec![1.0]])
        .unwrap();
    assert_relative_eq!(grads.state_adjoint[0], 0.9f64.powi(20), max_relative = 1e-12);
    assert!((grads.state_adjoint[0] - (-2.0f64).exp()).abs() < 1.5e-2);
    assert!(grads.parameter_adjoint.is_empty());
}

#[test]
fn exponential_decay_rk4_gradient_matches_continuum() {
    let settings = SessionSettings::default()
        .with_method(Method::Rk4)
        .with_step_size(0.1);
    let mut session = IntegrationSession::new(decay(), settings).unwrap();
    let times = [0.0, 1.0, 2.0];
    let grads = adjoint(&mut session, &[0.5], &times, &[vec![0.0], vec![0.0], vec![1.0]]);
    assert!((grads.state_adjoint[0] - (-2.0f64).exp()).abs() < 1e-2);
}

#[test]
fn trajectory_has_one_state_per_requested_time() {
    let settings = SessionSettings::default().with_step_size(0.05);
    let mut session = IntegrationSession::new(lotka_volterra(), settings).unwrap();
    let grids: [&[f64]; 3] = [&[0.0, 0.5], &[0.0, 0.1, 0.2, 0.35, 1.0], &[1.0, 1.5, 3.0]];
    for times in grids {
        let traj = session.odeint(&[1.0, 0.5], times).unwrap();
        assert_eq!(traj.len(), times.len());
        for (recorded, requested) in traj.times.iter().zip(times) {
            assert!((recorded - requested).abs() < 1e-6);
        }
    }
}

#[test]
fn equation_system_gradients_match_finite_differences() {
    let settings = SessionSettings::default()
        .with_method(Method::Dopri5Fixed)
        .with_step_size(0.01);
    let mut session = IntegrationSession::new(lotka_volterra(), settings).unwrap();
    let weights = vec![vec![0.3, -0.2], vec![1.0, 0.5], vec![-0.7, 2.0]];
    assert_matches_finite_differences(&mut session, &[1.0, 0.5], &[0.0, 0.5, 1.0], &weights, 1e-3);
}

#[test]
fn mlp_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(42);
    let net = Mlp::new(&[2, 8, 2], true, &mut rng).unwrap();
    let settings = SessionSettings::default()
        .with_method(Method::Rk4)
        .with_step_size(0.05);
    let mut session = IntegrationSession::new(net, settings).unwrap();
    let weights = vec![vec![0.0, 0.0], vec![1.0, -1.0], vec![0.5, 2.0]];
    assert_matches_finite_differences(&mut session, &[0.3, -0.6], &[0.0, 0.25, 0.5], &weights, 1e-3);
}

#[test]
fn backward_euler_gradients_match_finite_differences() {
    let f = system(
        &["x", "y"],
        &["a", "b", "c"],
        &["-a * x + sin(y)", "b * tanh(x) - c * y"],
        vec![2.0, 1.5, 0.8],
    );
    let settings = SessionSettings::default().implicit().with_step_size(0.05);
    let mut session = IntegrationSession::new(f, settings).unwrap();
    let weights = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.4, -1.2]];
    assert_matches_finite_differences(&mut session, &[0.7, -0.3], &[0.0, 0.5, 1.0], &weights, 1e-3);
}

#[test]
fn transfer_strategies_are_bit_identical() {
    let times = [0.0, 0.4, 0.8];
    let weights = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
    let run = |transfer: TransferStrategy, implicit: bool| {
        let mut settings = SessionSettings::default()
            .with_step_size(0.02)
            .with_transfer(transfer);
        if implicit {
            settings = settings.implicit();
        }
        let mut session = IntegrationSession::new(lotka_volterra(), settings).unwrap();
        let traj = session.odeint(&[1.0, 0.5], &times).unwrap();
        let grads = AdjointOrchestrator::new(&mut session)
            .run(&times, &weights)
            .unwrap();
        (traj, grads)
    };
    for implicit in [false, true] {
        let shared = run(TransferStrategy::Shared, implicit);
        let host = run(TransferStrategy::HostCopy, implicit);
        assert_eq!(shared, host);
    }
}

#[test]
fn graph_node_matches_orchestrator() {
    let settings = SessionSettings::default()
        .with_method(Method::Heun)
        .with_step_size(0.02);
    let times = [0.0, 0.3, 0.6];
    let weights = vec![vec![0.5, 0.25], vec![-1.0, 0.0], vec![2.0, 1.0]];

    let mut direct = IntegrationSession::new(lotka_volterra(), settings).unwrap();
    let expected = adjoint(&mut direct, &[1.0, 0.5], &times, &weights);

    let session = Rc::new(RefCell::new(
        IntegrationSession::new(lotka_volterra(), settings).unwrap(),
    ));
    let mut tape = Tape::new();
    let u0 = tape.variables(&[1.0, 0.5]);
    let theta = tape.variables(&lotka_volterra().parameters());
    let rows = odeint_adjoint(&session, &mut tape, &u0, &times, &theta).unwrap();

    let mut terms = Vec::new();
    for (row, w) in rows.iter().zip(&weights) {
        for (u, wk) in row.iter().zip(w) {
            let c = tape.constant(*wk);
            terms.push(tape.mul(c, *u));
        }
    }
    let loss = tape.sum(&terms);
    let one = tape.constant(1.0);
    let inputs: Vec<_> = u0.iter().chain(&theta).copied().collect();
    let grads = tape.grad(&[loss], &inputs, &[one]).unwrap();
    let values: Vec<f64> = grads.iter().map(|g| tape.value(g.unwrap())).collect();

    for (a, b) in values[..2].iter().zip(&expected.state_adjoint) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
    }
    for (a, b) in values[2..].iter().zip(&expected.parameter_adjoint) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
    }
}

#[test]
fn settings_round_trip_through_json() {
    let settings = SessionSettings::default()
        .implicit()
        .with_step_size(0.025)
        .with_transfer(TransferStrategy::HostCopy);
    let json = serde_json::to_string(&settings).unwrap();
    let back: SessionSettings = serde_json::from_str(&json).unwrap();
    assert_eq!(back, settings);

    let partial: SessionSettings =
        serde_json::from_str(r#"{"method": "midpoint", "step_size": 0.1}"#).unwrap();
    assert_eq!(partial.method, Method::Heun);
    assert_eq!(partial.form, EquationForm::Explicit);
    assert_eq!(partial.output_tolerance, 1e-6);
    assert!(json.contains("\"beuler\"") && json.contains("\"implicit_residual\""));
}
