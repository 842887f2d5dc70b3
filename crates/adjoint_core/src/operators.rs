//! Matrix-free operator shells handed to the time stepper.
//!
//! All shells evaluate the right-hand side through the reverse-mode tape. The
//! Jacobian shells read their linearization point from an
//! [`EvaluationCache`] and share the forward pass recorded there.

use crate::autodiff::{Tape, Var};
use crate::cache::EvaluationCache;
use crate::error::{check_len, Result, SolveError};
use crate::traits::DifferentiableFunction;
use crate::transfer::{HostBuffers, TransferStrategy};
use serde::{Deserialize, Serialize};

/// How the ODE is posed to the stepper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquationForm {
    /// u̇ = f(t, u; θ)
    #[default]
    Explicit,
    /// F(t, u, u̇) = u̇ − f(t, u; θ) = 0
    ImplicitResidual,
}

impl EquationForm {
    pub fn is_implicit(self) -> bool {
        matches!(self, EquationForm::ImplicitResidual)
    }
}

/// Evaluates f or the implicit residual into a caller buffer.
pub struct ForwardOperator {
    transfer: TransferStrategy,
    tape: Tape,
    host: HostBuffers,
}

impl ForwardOperator {
    pub fn new(transfer: TransferStrategy) -> Self {
        Self {
            transfer,
            tape: Tape::new(),
            host: HostBuffers::default(),
        }
    }

    /// dudt = f(t, u; params)
    pub fn evaluate<F: DifferentiableFunction + ?Sized>(
        &mut self,
        function: &F,
        params: &[f64],
        t: f64,
        u: &[f64],
        dudt: &mut [f64],
    ) -> Result<()> {
        check_len("output", u.len(), dudt.len())?;
        let values = self.record_values(function, params, t, u)?;
        self.transfer
            .write(dudt, &mut self.host.output, |out| out.copy_from_slice(&values));
        Ok(())
    }

    /// out = u̇ − f(t, u; params)
    pub fn evaluate_residual<F: DifferentiableFunction + ?Sized>(
        &mut self,
        function: &F,
        params: &[f64],
        t: f64,
        u: &[f64],
        udot: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        check_len("time derivative", u.len(), udot.len())?;
        check_len("output", u.len(), out.len())?;
        let values = self.record_values(function, params, t, u)?;
        let udot = self.transfer.read(udot, &mut self.host.aux);
        self.transfer.write(out, &mut self.host.output, |buf| {
            for ((r, ud), f) in buf.iter_mut().zip(udot).zip(&values) {
                *r = ud - f;
            }
        });
        Ok(())
    }

    fn record_values<F: DifferentiableFunction + ?Sized>(
        &mut self,
        function: &F,
        params: &[f64],
        t: f64,
        u: &[f64],
    ) -> Result<Vec<f64>> {
        let u = self.transfer.read(u, &mut self.host.input);
        self.tape.clear();
        let outputs = self.tape.no_grad(|tape| {
            let t = tape.constant(t);
            let u = tape.constants(u);
            let p = tape.constants(params);
            function.record(tape, t, &u, &p)
        })?;
        if outputs.len() != u.len() {
            return Err(SolveError::InvalidFunction(format!(
                "Function returned {} outputs for a {}-dimensional state.",
                outputs.len(),
                u.len()
            )));
        }
        Ok(self.tape.values(&outputs))
    }
}

/// Matrix-free action of ∂f/∂u (or of shift·I − ∂f/∂u in implicit form).
pub struct JacobianShell {
    form: EquationForm,
    transfer: TransferStrategy,
    host: HostBuffers,
}

impl JacobianShell {
    pub fn new(form: EquationForm, transfer: TransferStrategy) -> Self {
        Self {
            form,
            transfer,
            host: HostBuffers::default(),
        }
    }

    /// out = J·x, computed as the derivative of the VJP v ↦ Jᵀv along x.
    pub fn apply<F: DifferentiableFunction + ?Sized>(
        &mut self,
        cache: &mut EvaluationCache,
        function: &F,
        params: &[f64],
        x: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        let n = cache.dimension();
        check_len("Jacobian input", n, x.len())?;
        check_len("Jacobian output", n, out.len())?;
        let shift = cache.point()?.shift;
        let x = self.transfer.read(x, &mut self.host.input);

        let (tape, pass) = cache.linearize(function, params)?;
        let v = tape.variables(&vec![0.0; n]);
        let vjp = tape.grad(&pass.outputs, &pass.state, &v)?;
        let (g, cot): (Vec<Var>, Vec<f64>) = vjp
            .iter()
            .zip(x)
            .filter_map(|(g, xi)| g.map(|g| (g, *xi)))
            .unzip();
        let jvp = tape.no_grad(|tape| {
            let cot = tape.constants(&cot);
            tape.grad(&g, &v, &cot)
        })?;
        let jx: Vec<f64> = jvp
            .iter()
            .map(|d| d.map_or(0.0, |d| tape.value(d)))
            .collect();
        tape.truncate(pass.mark);

        let implicit = self.form.is_implicit();
        self.transfer.write(out, &mut self.host.output, |buf| {
            for ((o, xi), jxi) in buf.iter_mut().zip(x).zip(&jx) {
                *o = if implicit { shift * xi - jxi } else { *jxi };
            }
        });
        Ok(())
    }

    /// out = Jᵀ·x
    pub fn apply_transpose<F: DifferentiableFunction + ?Sized>(
        &mut self,
        cache: &mut EvaluationCache,
        function: &F,
        params: &[f64],
        x: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        let n = cache.dimension();
        check_len("Jacobian input", n, x.len())?;
        check_len("Jacobian output", n, out.len())?;
        let shift = cache.point()?.shift;
        let x = self.transfer.read(x, &mut self.host.input);

        let (tape, pass) = cache.linearize(function, params)?;
        let jtx = vjp_values(tape, &pass.outputs, &pass.state, x)?;
        tape.truncate(pass.mark);

        let implicit = self.form.is_implicit();
        self.transfer.write(out, &mut self.host.output, |buf| {
            for ((o, xi), v) in buf.iter_mut().zip(x).zip(&jtx) {
                *o = if implicit { shift * xi - v } else { *v };
            }
        });
        Ok(())
    }
}

/// Matrix-free transpose action of ∂f/∂θ over the flattened parameters.
pub struct ParameterJacobianShell {
    form: EquationForm,
    transfer: TransferStrategy,
    host: HostBuffers,
}

impl ParameterJacobianShell {
    pub fn new(form: EquationForm, transfer: TransferStrategy) -> Self {
        Self {
            form,
            transfer,
            host: HostBuffers::default(),
        }
    }

    /// out = (∂f/∂θ)ᵀ·x, or −(∂f/∂θ)ᵀ·x for the implicit residual.
    pub fn apply_transpose<F: DifferentiableFunction + ?Sized>(
        &mut self,
        cache: &mut EvaluationCache,
        function: &F,
        params: &[f64],
        x: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        check_len("parameter Jacobian input", cache.dimension(), x.len())?;
        check_len("parameter Jacobian output", params.len(), out.len())?;
        let x = self.transfer.read(x, &mut self.host.input);

        let (tape, pass) = cache.linearize(function, params)?;
        let ptx = vjp_values(tape, &pass.outputs, &pass.params, x)?;
        tape.truncate(pass.mark);

        let sign = if self.form.is_implicit() { -1.0 } else { 1.0 };
        self.transfer.write(out, &mut self.host.output, |buf| {
            for (o, v) in buf.iter_mut().zip(&ptx) {
                *o = sign * v;
            }
        });
        Ok(())
    }
}

/// First-order VJP with constant cotangents; missing gradients read as zero.
fn vjp_values(tape: &mut Tape, outputs: &[Var], inputs: &[Var], cotangents: &[f64]) -> Result<Vec<f64>> {
    let grads = tape.no_grad(|tape| {
        let cot = tape.constants(cotangents);
        tape.grad(outputs, inputs, &cot)
    })?;
    Ok(grads
        .iter()
        .map(|g| g.map_or(0.0, |g| tape.value(g)))
        .collect())
}
