//! Dense tanh network usable as a neural ODE right-hand side.

use crate::autodiff::{Tape, Var};
use crate::error::{check_len, Result, SolveError};
use crate::traits::DifferentiableFunction;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Tanh,
    Identity,
}

/// Single dense layer `activation(W x + b)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Weight matrix (output_dim x input_dim).
    pub weights: DMatrix<f64>,
    pub bias: DVector<f64>,
    pub activation: Activation,
}

impl Layer {
    /// Xavier/Glorot initialization with zero bias.
    pub fn xavier<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        let std_dev = (2.0 / (input_dim + output_dim) as f64).sqrt();
        let normal = Normal::new(0.0, std_dev)
            .map_err(|e| SolveError::Configuration(format!("Invalid initializer: {e}")))?;
        Ok(Self {
            weights: DMatrix::from_fn(output_dim, input_dim, |_, _| normal.sample(rng)),
            bias: DVector::zeros(output_dim),
            activation,
        })
    }

    pub fn num_params(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

/// Multi-layer perceptron f(t, u) with tanh hidden layers and a linear output layer.
///
/// Parameters are flattened layer by layer: weights in row-major order, then the bias.
/// With `time_input` the network sees `[u, t]` instead of `u`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mlp {
    layers: Vec<Layer>,
    time_input: bool,
}

impl Mlp {
    /// `dims` = [n, hidden..., n]; the first and last entries must agree since
    /// the network is a vector field on the state space.
    pub fn new<R: Rng + ?Sized>(dims: &[usize], time_input: bool, rng: &mut R) -> Result<Self> {
        if dims.len() < 2 {
            return Err(SolveError::InvalidFunction(
                "An MLP needs at least input and output dimensions.".to_string(),
            ));
        }
        let last = dims.len() - 2;
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let input = if i == 0 { w[0] + usize::from(time_input) } else { w[0] };
                let activation = if i == last {
                    Activation::Identity
                } else {
                    Activation::Tanh
                };
                Layer::xavier(input, w[1], activation, rng)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_layers(layers, time_input)
    }

    pub fn from_layers(layers: Vec<Layer>, time_input: bool) -> Result<Self> {
        let (Some(first), Some(last)) = (layers.first(), layers.last()) else {
            return Err(SolveError::InvalidFunction("An MLP needs at least one layer.".to_string()));
        };
        let state_dim = last.weights.nrows();
        if first.weights.ncols() != state_dim + usize::from(time_input) {
            return Err(SolveError::InvalidFunction(format!(
                "Input width {} does not match state dimension {}.",
                first.weights.ncols(),
                state_dim
            )));
        }
        for pair in layers.windows(2) {
            if pair[0].weights.nrows() != pair[1].weights.ncols() {
                return Err(SolveError::InvalidFunction(format!(
                    "Layer widths do not chain: {} outputs feed {} inputs.",
                    pair[0].weights.nrows(),
                    pair[1].weights.ncols()
                )));
            }
        }
        for layer in &layers {
            check_len("layer bias", layer.weights.nrows(), layer.bias.len())?;
        }
        Ok(Self { layers, time_input })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Plain evaluation, mainly for checking recorded passes.
    pub fn forward(&self, t: f64, u: &[f64]) -> Vec<f64> {
        let mut x: Vec<f64> = u.to_vec();
        if self.time_input {
            x.push(t);
        }
        let mut x = DVector::from_vec(x);
        for layer in &self.layers {
            let z = &layer.weights * &x + &layer.bias;
            x = match layer.activation {
                Activation::Tanh => z.map(f64::tanh),
                Activation::Identity => z,
            };
        }
        x.iter().copied().collect()
    }
}

impl DifferentiableFunction for Mlp {
    fn dimension(&self) -> usize {
        self.layers.last().map_or(0, |l| l.weights.nrows())
    }

    fn num_parameters(&self) -> usize {
        self.layers.iter().map(Layer::num_params).sum()
    }

    fn parameters(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.num_parameters());
        for layer in &self.layers {
            for row in layer.weights.row_iter() {
                flat.extend(row.iter());
            }
            flat.extend(layer.bias.iter());
        }
        flat
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        check_len("parameters", self.num_parameters(), params.len())?;
        let mut offset = 0;
        for layer in &mut self.layers {
            let (rows, cols) = layer.weights.shape();
            for i in 0..rows {
                for j in 0..cols {
                    layer.weights[(i, j)] = params[offset + i * cols + j];
                }
            }
            offset += rows * cols;
            layer.bias.copy_from_slice(&params[offset..offset + rows]);
            offset += rows;
        }
        Ok(())
    }

    fn record(&self, tape: &mut Tape, t: Var, u: &[Var], params: &[Var]) -> Result<Vec<Var>> {
        check_len("state", self.dimension(), u.len())?;
        check_len("parameters", self.num_parameters(), params.len())?;

        let mut x: Vec<Var> = u.to_vec();
        if self.time_input {
            x.push(t);
        }
        let mut offset = 0;
        for layer in &self.layers {
            let (rows, cols) = layer.weights.shape();
            let bias = offset + rows * cols;
            let next: Vec<Var> = (0..rows)
                .map(|i| {
                    let mut acc = params[bias + i];
                    for (j, xj) in x.iter().enumerate() {
                        let w = params[offset + i * cols + j];
                        let wx = tape.mul(w, *xj);
                        acc = tape.add(acc, wx);
                    }
                    match layer.activation {
                        Activation::Tanh => tape.tanh(acc),
                        Activation::Identity => acc,
                    }
                })
                .collect();
            x = next;
            offset = bias + rows;
        }
        Ok(x)
    }
}
