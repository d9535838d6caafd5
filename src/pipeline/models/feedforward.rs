//! Feedforward regressor: ReLU hidden layers, linear output

use super::mean_squared_error;
use super::optim::{clip_grad_norm, shuffled_batches, AdamW};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::regressor::{
    check_fit_shapes, check_parameter_len, check_predict_shape, FitSummary, Regressor,
    TrainingParams,
};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_GRAD_NORM: f64 = 1.0;
const WEIGHT_DECAY: f64 = 0.01;

/// One fully connected layer: `output = input · weights + biases`
///
/// Gradients and optimizer moments reuse the same shape.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dense {
    /// `n_in x n_out`
    pub weights: Array2<f64>,
    /// `n_out`
    pub biases: Array1<f64>,
}

impl Dense {
    /// Xavier-uniform weights, zero biases
    fn xavier<R: Rng>(n_in: usize, n_out: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (n_in + n_out) as f64).sqrt();
        Self {
            weights: Array2::from_shape_fn((n_in, n_out), |_| rng.gen_range(-limit..limit)),
            biases: Array1::zeros(n_out),
        }
    }

    pub fn zeros_like(other: &Dense) -> Self {
        Self {
            weights: Array2::zeros(other.weights.raw_dim()),
            biases: Array1::zeros(other.biases.raw_dim()),
        }
    }

    fn n_in(&self) -> usize {
        self.weights.nrows()
    }

    fn n_out(&self) -> usize {
        self.weights.ncols()
    }

    fn len(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn affine(&self, input: &Array2<f64>) -> Array2<f64> {
        input.dot(&self.weights) + &self.biases
    }
}

/// Pre-activations and activations of every layer for one batch
struct Trace {
    zs: Vec<Array2<f64>>,
    activations: Vec<Array2<f64>>,
}

fn forward(layers: &[Dense], input: &Array2<f64>) -> Trace {
    let mut zs = Vec::with_capacity(layers.len());
    let mut activations = Vec::with_capacity(layers.len() + 1);
    activations.push(input.clone());

    for (l, layer) in layers.iter().enumerate() {
        let z = layer.affine(&activations[l]);
        let a = if l + 1 == layers.len() {
            z.clone()
        } else {
            z.mapv(|v| v.max(0.0))
        };
        zs.push(z);
        activations.push(a);
    }
    Trace { zs, activations }
}

fn output(layers: &[Dense], input: &Array2<f64>) -> Array2<f64> {
    let mut a = input.clone();
    for (l, layer) in layers.iter().enumerate() {
        a = layer.affine(&a);
        if l + 1 < layers.len() {
            a.mapv_inplace(|v| v.max(0.0));
        }
    }
    a
}

/// MSE gradients for one batch
fn backward(layers: &[Dense], x: &Array2<f64>, y: &Array2<f64>) -> Vec<Dense> {
    let trace = forward(layers, x);
    let scale = 2.0 / y.len().max(1) as f64;
    let mut delta = (&trace.activations[layers.len()] - y) * scale;

    let mut grads: Vec<Dense> = Vec::with_capacity(layers.len());
    for l in (0..layers.len()).rev() {
        let a_prev = &trace.activations[l];
        grads.push(Dense {
            weights: a_prev.t().dot(&delta),
            biases: delta.sum_axis(Axis(0)),
        });
        if l > 0 {
            let relu_grad = trace.zs[l - 1].mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
            delta = delta.dot(&layers[l].weights.t()) * relu_grad;
        }
    }
    grads.reverse();
    grads
}

#[derive(Debug, Clone)]
pub struct FeedforwardRegressor {
    layers: Vec<Dense>,
    training: TrainingParams,
    /// advanced once per fit so successive fits shuffle differently
    fits: u64,
}

impl FeedforwardRegressor {
    pub fn new(
        n_inputs: usize,
        n_outputs: usize,
        hidden_dims: &[usize],
        training: TrainingParams,
    ) -> PipelineResult<Self> {
        if n_inputs == 0 || n_outputs == 0 || hidden_dims.contains(&0) {
            return Err(PipelineError::Configuration(format!(
                "feedforward regressor needs positive widths, got {} -> {:?} -> {}",
                n_inputs, hidden_dims, n_outputs
            )));
        }

        let mut widths = Vec::with_capacity(hidden_dims.len() + 2);
        widths.push(n_inputs);
        widths.extend_from_slice(hidden_dims);
        widths.push(n_outputs);

        let mut rng = StdRng::seed_from_u64(training.seed);
        let layers = widths
            .windows(2)
            .map(|pair| Dense::xavier(pair[0], pair[1], &mut rng))
            .collect();

        Ok(Self {
            layers,
            training,
            fits: 0,
        })
    }
}

impl Regressor for FeedforwardRegressor {
    fn fit(&mut self, x: &Array2<f64>, y: &Array2<f64>) -> PipelineResult<FitSummary> {
        check_fit_shapes(x, y, self.n_inputs(), self.n_outputs())?;

        self.fits += 1;
        let mut rng = StdRng::seed_from_u64(self.training.seed.wrapping_add(self.fits));

        // Train on a copy so a failed fit leaves the parameters untouched
        let mut layers = self.layers.clone();
        let mut optimizer = AdamW::new(&layers, self.training.learning_rate, WEIGHT_DECAY);

        for _epoch in 0..self.training.epochs {
            for batch in shuffled_batches(x.nrows(), self.training.batch_size, &mut rng) {
                let xb = x.select(Axis(0), &batch);
                let yb = y.select(Axis(0), &batch);
                let mut grads = backward(&layers, &xb, &yb);
                clip_grad_norm(&mut grads, MAX_GRAD_NORM);
                optimizer.step(&mut layers, &grads);
            }

            let diverged = layers
                .iter()
                .any(|l| l.weights.iter().chain(l.biases.iter()).any(|p| !p.is_finite()));
            if diverged {
                return Err(PipelineError::Training("parameters diverged".to_string()));
            }
        }

        let final_loss = mean_squared_error(&output(&layers, x), y);
        if !final_loss.is_finite() {
            return Err(PipelineError::Training("non-finite training loss".to_string()));
        }
        self.layers = layers;

        Ok(FitSummary {
            epochs: self.training.epochs,
            final_loss,
        })
    }

    fn predict(&self, x: &Array2<f64>) -> PipelineResult<Array2<f64>> {
        check_predict_shape(x, self.n_inputs())?;
        if x.nrows() == 0 {
            return Ok(Array2::zeros((0, self.n_outputs())));
        }
        Ok(output(&self.layers, x))
    }

    fn parameters(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.layers.iter().map(Dense::len).sum());
        for layer in &self.layers {
            params.extend(layer.weights.iter());
            params.extend(layer.biases.iter());
        }
        params
    }

    fn load_parameters(&mut self, params: &[f64]) -> PipelineResult<()> {
        let expected: usize = self.layers.iter().map(Dense::len).sum();
        check_parameter_len(expected, params.len())?;

        let mut loaded = Vec::with_capacity(self.layers.len());
        let mut offset = 0;
        for layer in &self.layers {
            let n_w = layer.weights.len();
            let n_b = layer.biases.len();
            let weights =
                Array2::from_shape_vec(layer.weights.raw_dim(), params[offset..offset + n_w].to_vec())?;
            let biases = Array1::from(params[offset + n_w..offset + n_w + n_b].to_vec());
            offset += n_w + n_b;
            loaded.push(Dense { weights, biases });
        }
        self.layers = loaded;
        Ok(())
    }

    fn n_inputs(&self) -> usize {
        self.layers.first().map(Dense::n_in).unwrap_or(0)
    }

    fn n_outputs(&self) -> usize {
        self.layers.last().map(Dense::n_out).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn params(epochs: usize) -> TrainingParams {
        TrainingParams {
            epochs,
            batch_size: 16,
            learning_rate: 0.01,
            seed: 42,
        }
    }

    fn grid() -> (Array2<f64>, Array2<f64>) {
        let x = Array2::from_shape_fn((64, 2), |(i, c)| {
            if c == 0 {
                (i % 8) as f64 / 8.0
            } else {
                (i / 8) as f64 / 8.0
            }
        });
        let y = Array2::from_shape_fn((64, 1), |(i, _)| x[[i, 0]] + 0.5 * x[[i, 1]]);
        (x, y)
    }

    #[test]
    fn test_parameter_count() {
        let model = FeedforwardRegressor::new(4, 3, &[16, 16, 16], params(1)).unwrap();
        // 4*16+16 + 16*16+16 + 16*16+16 + 16*3+3
        assert_eq!(model.parameters().len(), 80 + 272 + 272 + 51);
        assert_eq!(model.n_inputs(), 4);
        assert_eq!(model.n_outputs(), 3);
    }

    #[test]
    fn test_rejects_zero_width() {
        assert!(FeedforwardRegressor::new(4, 1, &[8, 0], params(1)).is_err());
    }

    #[test]
    fn test_training_reduces_loss() {
        let (x, y) = grid();
        let mut model = FeedforwardRegressor::new(2, 1, &[8], params(200)).unwrap();
        let before = mean_squared_error(&model.predict(&x).unwrap(), &y);
        let summary = model.fit(&x, &y).unwrap();
        assert!(summary.final_loss < before, "{} !< {}", summary.final_loss, before);
        assert_eq!(summary.epochs, 200);
    }

    #[test]
    fn test_parameters_round_trip_through_load() {
        let model = FeedforwardRegressor::new(3, 2, &[5, 4], params(1)).unwrap();
        let reseeded = TrainingParams { seed: 7, ..params(1) };
        let mut other = FeedforwardRegressor::new(3, 2, &[5, 4], reseeded).unwrap();
        other.load_parameters(&model.parameters()).unwrap();

        let x = array![[0.1, -0.2, 0.3], [1.0, 0.5, -1.5]];
        assert_eq!(other.predict(&x).unwrap(), model.predict(&x).unwrap());
        assert!(other.load_parameters(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_failed_fit_keeps_parameters() {
        let (x, y) = grid();
        let mut model = FeedforwardRegressor::new(2, 1, &[8], params(5)).unwrap();
        let before = model.parameters();

        let mut bad = y.clone();
        bad[[3, 0]] = f64::INFINITY;
        assert!(model.fit(&x, &bad).is_err());
        assert_eq!(model.parameters(), before);

        // the second AdamW step overflows every parameter with a nonzero gradient
        let overflowing = TrainingParams {
            learning_rate: f64::MAX,
            ..params(5)
        };
        let mut wild = FeedforwardRegressor::new(2, 1, &[8], overflowing).unwrap();
        let before = wild.parameters();
        assert!(matches!(wild.fit(&x, &y), Err(PipelineError::Training(_))));
        assert_eq!(wild.parameters(), before);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let model = FeedforwardRegressor::new(4, 2, &[8], params(1)).unwrap();
        let x = array![[0.1, 0.2, 0.3, 0.4]];
        assert_eq!(model.predict(&x).unwrap(), model.predict(&x).unwrap());
    }
}
