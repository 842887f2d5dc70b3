//! Reverse-mode automatic differentiation on an explicit tape.
//!
//! Every arithmetic call on [`Tape`] appends a node holding its value and the
//! operation that produced it. [`Tape::grad`] sweeps the tape backwards and
//! records the adjoint arithmetic on the same tape, so a gradient can itself be
//! differentiated again (double backward). Inputs that the outputs do not
//! depend on come back as `None`.

use crate::error::{check_len, Result, SolveError};
use std::ops::Range;

/// Handle to a node on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

#[derive(Debug, Clone, Copy)]
enum Op {
    Leaf,
    Const,
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Div(Var, Var),
    Pow(Var, Var),
    Neg(Var),
    Sin(Var),
    Cos(Var),
    Exp(Var),
    Ln(Var),
    Tanh(Var),
    /// Output of the custom node with the given id.
    Custom(usize),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    value: f64,
    op: Op,
}

/// User-supplied backward logic for a black-box node.
///
/// `grad_output` holds one cotangent per node output (zeros for outputs the
/// loss does not reach). The result holds one optional gradient per input
/// group registered with [`Tape::custom`]; `None` marks a non-differentiable
/// input.
pub trait CustomBackward {
    fn backward(&mut self, grad_output: &[f64]) -> Result<Vec<Option<Vec<f64>>>>;
}

struct CustomNode {
    inputs: Vec<Vec<Var>>,
    outputs: Range<usize>,
    backward: Box<dyn CustomBackward>,
}

pub struct Tape {
    nodes: Vec<Node>,
    customs: Vec<CustomNode>,
    grad_enabled: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(256),
            customs: Vec::new(),
            grad_enabled: true,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.customs.clear();
    }

    /// Drops every node recorded after `mark` (a previous [`Tape::len`]).
    pub fn truncate(&mut self, mark: usize) {
        self.nodes.truncate(mark);
        self.customs.retain(|c| c.outputs.end <= mark);
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    /// Returns the previous setting.
    pub fn set_grad_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.grad_enabled, enabled)
    }

    /// Runs `f` with gradient tracking disabled: every node it creates is a constant.
    pub fn no_grad<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.set_grad_enabled(false);
        let out = f(self);
        self.grad_enabled = previous;
        out
    }

    pub fn value(&self, var: Var) -> f64 {
        self.nodes[var.0].value
    }

    pub fn values(&self, vars: &[Var]) -> Vec<f64> {
        vars.iter().map(|v| self.value(*v)).collect()
    }

    /// Creates an independent variable that gradients can be taken with respect to.
    pub fn variable(&mut self, value: f64) -> Var {
        self.push_raw(value, Op::Leaf)
    }

    pub fn variables(&mut self, values: &[f64]) -> Vec<Var> {
        values.iter().map(|&v| self.variable(v)).collect()
    }

    pub fn constant(&mut self, value: f64) -> Var {
        self.push_raw(value, Op::Const)
    }

    pub fn constants(&mut self, values: &[f64]) -> Vec<Var> {
        values.iter().map(|&v| self.constant(v)).collect()
    }

    fn push_raw(&mut self, value: f64, op: Op) -> Var {
        let idx = self.nodes.len();
        self.nodes.push(Node { value, op });
        Var(idx)
    }

    fn push(&mut self, value: f64, op: Op) -> Var {
        let op = if self.grad_enabled { op } else { Op::Const };
        self.push_raw(value, op)
    }

    pub fn add(&mut self, a: Var, b: Var) -> Var {
        let v = self.value(a) + self.value(b);
        self.push(v, Op::Add(a, b))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Var {
        let v = self.value(a) - self.value(b);
        self.push(v, Op::Sub(a, b))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Var {
        let v = self.value(a) * self.value(b);
        self.push(v, Op::Mul(a, b))
    }

    pub fn div(&mut self, a: Var, b: Var) -> Var {
        let v = self.value(a) / self.value(b);
        self.push(v, Op::Div(a, b))
    }

    pub fn powf(&mut self, a: Var, b: Var) -> Var {
        let v = self.value(a).powf(self.value(b));
        self.push(v, Op::Pow(a, b))
    }

    pub fn neg(&mut self, a: Var) -> Var {
        let v = -self.value(a);
        self.push(v, Op::Neg(a))
    }

    pub fn sin(&mut self, a: Var) -> Var {
        let v = self.value(a).sin();
        self.push(v, Op::Sin(a))
    }

    pub fn cos(&mut self, a: Var) -> Var {
        let v = self.value(a).cos();
        self.push(v, Op::Cos(a))
    }

    pub fn exp(&mut self, a: Var) -> Var {
        let v = self.value(a).exp();
        self.push(v, Op::Exp(a))
    }

    pub fn ln(&mut self, a: Var) -> Var {
        let v = self.value(a).ln();
        self.push(v, Op::Ln(a))
    }

    pub fn tanh(&mut self, a: Var) -> Var {
        let v = self.value(a).tanh();
        self.push(v, Op::Tanh(a))
    }

    /// Sum of `vars`; a zero constant when empty.
    pub fn sum(&mut self, vars: &[Var]) -> Var {
        match vars.split_first() {
            None => self.constant(0.0),
            Some((first, rest)) => rest.iter().fold(*first, |acc, v| self.add(acc, *v)),
        }
    }

    /// Inserts a black-box node. `output_values` are the forward results; the
    /// returned variables carry them. Under `no_grad` the outputs are constants
    /// and `backward` is dropped.
    pub fn custom(
        &mut self,
        inputs: Vec<Vec<Var>>,
        output_values: &[f64],
        backward: Box<dyn CustomBackward>,
    ) -> Vec<Var> {
        if !self.grad_enabled {
            return self.constants(output_values);
        }
        let id = self.customs.len();
        let start = self.nodes.len();
        let outputs: Vec<Var> = output_values
            .iter()
            .map(|&v| self.push_raw(v, Op::Custom(id)))
            .collect();
        self.customs.push(CustomNode {
            inputs,
            outputs: start..self.nodes.len(),
            backward,
        });
        outputs
    }

    /// Vector-Jacobian product Σ_k cotangents[k] · ∂outputs[k]/∂inputs.
    ///
    /// The adjoint arithmetic is recorded on the tape, so the returned
    /// variables can be differentiated again. An input with no dependency path
    /// from any output yields `None`.
    pub fn grad(
        &mut self,
        outputs: &[Var],
        inputs: &[Var],
        cotangents: &[Var],
    ) -> Result<Vec<Option<Var>>> {
        check_len("cotangents", outputs.len(), cotangents.len())?;
        let end = match outputs.iter().map(|v| v.0 + 1).max() {
            Some(end) => end,
            None => return Ok(vec![None; inputs.len()]),
        };

        let needs = self.reachability(end, inputs);
        let mut adjoints: Vec<Option<Var>> = vec![None; end];
        for (out, cot) in outputs.iter().zip(cotangents) {
            if needs[out.0] {
                self.accumulate(&mut adjoints, *out, *cot);
            }
        }

        for i in (0..end).rev() {
            if !needs[i] {
                continue;
            }
            let op = self.nodes[i].op;
            if let Op::Custom(id) = op {
                if i == self.customs[id].outputs.start {
                    self.custom_backward(id, &mut adjoints, &needs)?;
                }
                continue;
            }
            let Some(g) = adjoints[i] else {
                continue;
            };
            let out = Var(i);
            match op {
                Op::Leaf | Op::Const | Op::Custom(_) => {}
                Op::Add(a, b) => {
                    self.propagate(&mut adjoints, &needs, a, |_| g);
                    self.propagate(&mut adjoints, &needs, b, |_| g);
                }
                Op::Sub(a, b) => {
                    self.propagate(&mut adjoints, &needs, a, |_| g);
                    self.propagate(&mut adjoints, &needs, b, |t| t.neg(g));
                }
                Op::Mul(a, b) => {
                    self.propagate(&mut adjoints, &needs, a, |t| t.mul(g, b));
                    self.propagate(&mut adjoints, &needs, b, |t| t.mul(g, a));
                }
                Op::Div(a, b) => {
                    self.propagate(&mut adjoints, &needs, a, |t| t.div(g, b));
                    // d(a/b)/db = -(a/b)/b
                    self.propagate(&mut adjoints, &needs, b, |t| {
                        let q = t.div(out, b);
                        let gq = t.mul(g, q);
                        t.neg(gq)
                    });
                }
                Op::Pow(a, b) => {
                    self.propagate(&mut adjoints, &needs, a, |t| {
                        let one = t.constant(1.0);
                        let b_minus_one = t.sub(b, one);
                        let p = t.powf(a, b_minus_one);
                        let bp = t.mul(b, p);
                        t.mul(g, bp)
                    });
                    self.propagate(&mut adjoints, &needs, b, |t| {
                        let ln_a = t.ln(a);
                        let o = t.mul(out, ln_a);
                        t.mul(g, o)
                    });
                }
                Op::Neg(a) => self.propagate(&mut adjoints, &needs, a, |t| t.neg(g)),
                Op::Sin(a) => self.propagate(&mut adjoints, &needs, a, |t| {
                    let c = t.cos(a);
                    t.mul(g, c)
                }),
                Op::Cos(a) => self.propagate(&mut adjoints, &needs, a, |t| {
                    let s = t.sin(a);
                    let gs = t.mul(g, s);
                    t.neg(gs)
                }),
                Op::Exp(a) => self.propagate(&mut adjoints, &needs, a, |t| t.mul(g, out)),
                Op::Ln(a) => self.propagate(&mut adjoints, &needs, a, |t| t.div(g, a)),
                Op::Tanh(a) => self.propagate(&mut adjoints, &needs, a, |t| {
                    let one = t.constant(1.0);
                    let sq = t.mul(out, out);
                    let d = t.sub(one, sq);
                    t.mul(g, d)
                }),
            }
        }

        Ok(inputs
            .iter()
            .map(|v| if v.0 < end { adjoints[v.0] } else { None })
            .collect())
    }

    /// Marks the nodes below `end` that depend on at least one of `inputs`.
    fn reachability(&self, end: usize, inputs: &[Var]) -> Vec<bool> {
        let mut needs = vec![false; end];
        for input in inputs {
            if input.0 < end {
                needs[input.0] = true;
            }
        }
        for i in 0..end {
            if needs[i] {
                continue;
            }
            needs[i] = match self.nodes[i].op {
                Op::Leaf | Op::Const => false,
                Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::Div(a, b) | Op::Pow(a, b) => {
                    needs[a.0] || needs[b.0]
                }
                Op::Neg(a) | Op::Sin(a) | Op::Cos(a) | Op::Exp(a) | Op::Ln(a) | Op::Tanh(a) => {
                    needs[a.0]
                }
                Op::Custom(id) => self.customs[id]
                    .inputs
                    .iter()
                    .flatten()
                    .any(|v| needs[v.0]),
            };
        }
        needs
    }

    fn accumulate(&mut self, adjoints: &mut [Option<Var>], target: Var, contribution: Var) {
        adjoints[target.0] = Some(match adjoints[target.0] {
            None => contribution,
            Some(prev) => self.add(prev, contribution),
        });
    }

    fn propagate(
        &mut self,
        adjoints: &mut [Option<Var>],
        needs: &[bool],
        target: Var,
        contribution: impl FnOnce(&mut Self) -> Var,
    ) {
        if needs[target.0] {
            let c = contribution(self);
            self.accumulate(adjoints, target, c);
        }
    }

    fn custom_backward(
        &mut self,
        id: usize,
        adjoints: &mut [Option<Var>],
        needs: &[bool],
    ) -> Result<()> {
        let range = self.customs[id].outputs.clone();
        if range.clone().all(|k| adjoints[k].is_none()) {
            return Ok(());
        }
        let grad_output: Vec<f64> = range
            .map(|k| adjoints[k].map_or(0.0, |g| self.value(g)))
            .collect();

        let grads = self.customs[id].backward.backward(&grad_output)?;
        let groups = self.customs[id].inputs.clone();
        if grads.len() != groups.len() {
            return Err(SolveError::DimensionMismatch {
                what: "custom node input gradients",
                expected: groups.len(),
                actual: grads.len(),
            });
        }

        for (group, grad) in groups.iter().zip(grads) {
            let Some(grad) = grad else {
                continue;
            };
            check_len("custom node input gradient", group.len(), grad.len())?;
            for (var, value) in group.iter().zip(grad) {
                if needs[var.0] {
                    let c = self.constant(value);
                    self.accumulate(adjoints, *var, c);
                }
            }
        }
        Ok(())
    }
}
