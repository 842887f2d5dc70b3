pub mod adjoint;
pub mod autodiff;
pub mod cache;
pub mod equation_engine;
pub mod error;
pub mod gradient_node;
pub mod network;
pub mod operators;
pub mod recorder;
pub mod session;
pub mod solvers;
pub mod transfer;
/// The `adjoint_core` crate integrates differentiable ODEs forward in time and
/// computes gradients of trajectory losses by discrete adjoint sensitivity analysis.
///
/// Key components:
/// - **Traits**: `DifferentiableFunction` (right-hand sides recordable on the tape).
/// - **Autodiff**: Reverse-mode `Tape` with double backward and custom nodes.
/// - **Equation Engine**: Bytecode VM for user-defined right-hand sides; `network` adds an MLP.
/// - **Operators**: Forward, Jacobian and parameter-Jacobian shells over an `EvaluationCache`.
/// - **Solvers**: Fixed-step RK methods and backward Euler with discrete adjoints.
/// - **Session / Adjoint / Gradient node**: `odeint`, the interval-wise backward pass and
///   the custom-gradient node joining both.
pub mod traits;

pub use adjoint::{AdjointOrchestrator, AdjointState};
pub use error::{Result, SolveError};
pub use gradient_node::{odeint_adjoint, CustomGradient, DifferentiableSolveNode, SavedSolve, SolveInput};
pub use operators::EquationForm;
pub use recorder::Trajectory;
pub use session::{IntegrationSession, SessionSettings};
pub use solvers::{FixedStepIntegrator, Method, NewtonSettings, OdeCallbacks, TimeStepper};
pub use transfer::TransferStrategy;
