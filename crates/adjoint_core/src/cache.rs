//! The current linearization point shared by all Jacobian shells.

use crate::autodiff::{Tape, Var};
use crate::error::{check_len, Result, SolveError};
use crate::traits::DifferentiableFunction;

/// Point at which Jacobian actions are evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPoint {
    pub time: f64,
    pub state: Vec<f64>,
    /// Coefficient of u̇ in the implicit iteration matrix; zero for explicit forms.
    pub shift: f64,
}

/// Variables of the forward pass recorded at the cached point.
#[derive(Debug, Clone)]
pub(crate) struct RecordedPass {
    pub state: Vec<Var>,
    pub params: Vec<Var>,
    pub outputs: Vec<Var>,
    /// Tape length right after the pass; actions truncate back to it.
    pub mark: usize,
}

/// Holds the most recent (t, u, shift) handed over by the stepper's
/// Jacobian-preparation hook.
///
/// Every Jacobian action reads the point stored by the latest `set`. The
/// stepper is responsible for calling `set` before the actions of each step;
/// an action issued after a later step without a new `set` silently
/// linearizes at the old point. Only use before the very first `set` is
/// reported, as [`SolveError::LinearizationNotPrepared`].
pub struct EvaluationCache {
    point: EvaluationPoint,
    prepared: bool,
    tape: Tape,
    recorded: Option<RecordedPass>,
}

impl EvaluationCache {
    pub fn new(dimension: usize) -> Self {
        Self {
            point: EvaluationPoint {
                time: 0.0,
                state: vec![0.0; dimension],
                shift: 0.0,
            },
            prepared: false,
            tape: Tape::new(),
            recorded: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.point.state.len()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn set(&mut self, t: f64, u: &[f64]) -> Result<()> {
        self.set_shifted(t, u, 0.0)
    }

    pub fn set_shifted(&mut self, t: f64, u: &[f64], shift: f64) -> Result<()> {
        check_len("linearization state", self.dimension(), u.len())?;
        self.point.time = t;
        self.point.state.copy_from_slice(u);
        self.point.shift = shift;
        self.prepared = true;
        self.recorded = None;
        Ok(())
    }

    /// Forgets the point; the next action fails until `set` is called again.
    pub fn invalidate(&mut self) {
        self.prepared = false;
        self.recorded = None;
        self.tape.clear();
    }

    pub fn point(&self) -> Result<&EvaluationPoint> {
        if self.prepared {
            Ok(&self.point)
        } else {
            Err(SolveError::LinearizationNotPrepared)
        }
    }

    /// Records f at the cached point once and hands out the tape holding it.
    /// Subsequent calls until the next `set` reuse the same pass.
    pub(crate) fn linearize<F: DifferentiableFunction + ?Sized>(
        &mut self,
        function: &F,
        params: &[f64],
    ) -> Result<(&mut Tape, &RecordedPass)> {
        if !self.prepared {
            return Err(SolveError::LinearizationNotPrepared);
        }
        if self.recorded.is_none() {
            self.tape.clear();
            let t = self.tape.constant(self.point.time);
            let state = self.tape.variables(&self.point.state);
            let param_vars = self.tape.variables(params);
            let outputs = function.record(&mut self.tape, t, &state, &param_vars)?;
            if outputs.len() != state.len() {
                return Err(SolveError::InvalidFunction(format!(
                    "Function returned {} outputs for a {}-dimensional state.",
                    outputs.len(),
                    state.len()
                )));
            }
            let mark = self.tape.len();
            self.recorded = Some(RecordedPass {
                state,
                params: param_vars,
                outputs,
                mark,
            });
        }
        match self.recorded.as_ref() {
            Some(pass) => Ok((&mut self.tape, pass)),
            None => Err(SolveError::LinearizationNotPrepared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::EquationSystem;

    #[test]
    fn reading_before_first_set_is_an_error() {
        let cache = EvaluationCache::new(2);
        assert!(matches!(
            cache.point(),
            Err(SolveError::LinearizationNotPrepared)
        ));
    }

    #[test]
    fn set_rejects_wrong_dimension() {
        let mut cache = EvaluationCache::new(2);
        let err = cache.set(0.0, &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            SolveError::DimensionMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn latest_set_wins() {
        let mut cache = EvaluationCache::new(1);
        cache.set(0.0, &[1.0]).unwrap();
        cache.set_shifted(0.5, &[2.0], 10.0).unwrap();
        let point = cache.point().unwrap();
        assert_eq!(point.time, 0.5);
        assert_eq!(point.state, vec![2.0]);
        assert_eq!(point.shift, 10.0);

        cache.invalidate();
        assert!(!cache.is_prepared());
    }

    #[test]
    fn linearization_is_recorded_once_per_point() {
        let system = EquationSystem::compile(
            &["x".to_string()],
            &["k".to_string()],
            &["-k * x"],
            vec![0.5],
        )
        .unwrap();
        let mut cache = EvaluationCache::new(1);
        cache.set(0.0, &[3.0]).unwrap();
        let mark = {
            let (tape, pass) = cache.linearize(&system, &[0.5]).unwrap();
            assert_eq!(tape.value(pass.outputs[0]), -1.5);
            pass.mark
        };
        let (tape, pass) = cache.linearize(&system, &[0.5]).unwrap();
        assert_eq!(pass.mark, mark);
        assert_eq!(tape.len(), mark);
    }
}
