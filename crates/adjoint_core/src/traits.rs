use crate::autodiff::{Tape, Var};
use crate::error::Result;

/// A right-hand side f(t, u; θ) that can be recorded on a reverse-mode tape.
///
/// Implementations must not keep state between calls other than their
/// learnable parameters. The parameters are exposed as one flattened vector
/// whose length never changes for the lifetime of the function.
pub trait DifferentiableFunction {
    /// Number of state variables `n`.
    fn dimension(&self) -> usize;

    /// Length `p` of the flattened parameter vector.
    fn num_parameters(&self) -> usize;

    fn parameters(&self) -> Vec<f64>;

    fn set_parameters(&mut self, params: &[f64]) -> Result<()>;

    /// Records f(t, u; params) on `tape` and returns the `n` outputs.
    ///
    /// `params` are tape variables standing for the flattened parameter
    /// vector; implementations read their parameters from there, not from
    /// their own storage, so that parameter gradients can be taken.
    fn record(&self, tape: &mut Tape, t: Var, u: &[Var], params: &[Var]) -> Result<Vec<Var>>;
}
