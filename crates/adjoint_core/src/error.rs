use thiserror::Error;

/// Errors surfaced by sessions, operators and the time stepper.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("Invalid differentiable function: {0}")]
    InvalidFunction(String),

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid output times: {0}")]
    InvalidOutputTimes(String),

    #[error("Equation compile error: {0}")]
    Compile(String),

    /// The step grid never landed within tolerance of some requested output time.
    #[error("Trajectory recorded {recorded} of {requested} requested output times (next missed time: {missed}).")]
    MissedOutputTimes {
        recorded: usize,
        requested: usize,
        missed: f64,
    },

    #[error("Jacobian action requested before any linearization point was prepared.")]
    LinearizationNotPrepared,

    #[error("Adjoint unavailable: {0}")]
    AdjointUnavailable(String),

    #[error("Adjoint integration ended at t = {actual}, expected t = {expected}.")]
    AdjointTimeMismatch { expected: f64, actual: f64 },

    #[error("Saved solve {saved} no longer matches the session checkpoints (current solve {current}).")]
    StaleSolve { saved: u64, current: u64 },

    #[error(transparent)]
    Integrator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SolveError>;

pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(SolveError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
