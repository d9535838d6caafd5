//! Optimizer helpers for iteratively trained models

use super::feedforward::Dense;
use ndarray::{Array, Dimension, Zip};
use rand::seq::SliceRandom;
use rand::Rng;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPSILON: f64 = 1e-8;

/// Per-step constants shared by every tensor update
#[derive(Debug, Clone, Copy)]
struct StepScale {
    lr: f64,
    weight_decay: f64,
    bias1: f64,
    bias2: f64,
}

impl StepScale {
    fn apply<D: Dimension>(
        &self,
        param: &mut Array<f64, D>,
        grad: &Array<f64, D>,
        m: &mut Array<f64, D>,
        v: &mut Array<f64, D>,
    ) {
        Zip::from(param)
            .and(grad)
            .and(m)
            .and(v)
            .for_each(|p, &g, m, v| {
                *m = BETA1 * *m + (1.0 - BETA1) * g;
                *v = BETA2 * *v + (1.0 - BETA2) * g * g;
                let m_hat = *m / self.bias1;
                let v_hat = *v / self.bias2;
                *p -= self.lr * (m_hat / (v_hat.sqrt() + EPSILON) + self.weight_decay * *p);
            });
    }
}

/// Adam with decoupled weight decay, one moment pair per layer tensor
///
/// A fresh optimizer is created for every fit.
pub(crate) struct AdamW {
    lr: f64,
    weight_decay: f64,
    m: Vec<Dense>,
    v: Vec<Dense>,
    step: i32,
}

impl AdamW {
    pub fn new(layers: &[Dense], lr: f64, weight_decay: f64) -> Self {
        let zeros: Vec<Dense> = layers.iter().map(Dense::zeros_like).collect();
        Self {
            lr,
            weight_decay,
            m: zeros.clone(),
            v: zeros,
            step: 0,
        }
    }

    pub fn step(&mut self, layers: &mut [Dense], grads: &[Dense]) {
        self.step += 1;
        let scale = StepScale {
            lr: self.lr,
            weight_decay: self.weight_decay,
            bias1: 1.0 - BETA1.powi(self.step),
            bias2: 1.0 - BETA2.powi(self.step),
        };

        for (((layer, grad), m), v) in layers
            .iter_mut()
            .zip(grads)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            scale.apply(&mut layer.weights, &grad.weights, &mut m.weights, &mut v.weights);
            scale.apply(&mut layer.biases, &grad.biases, &mut m.biases, &mut v.biases);
        }
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`
pub(crate) fn clip_grad_norm(grads: &mut [Dense], max_norm: f64) -> f64 {
    let norm = grads
        .iter()
        .flat_map(|g| g.weights.iter().chain(g.biases.iter()))
        .map(|g| g * g)
        .sum::<f64>()
        .sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-12);
        for g in grads.iter_mut() {
            g.weights.mapv_inplace(|v| v * scale);
            g.biases.mapv_inplace(|v| v * scale);
        }
    }
    norm
}

/// Shuffled row indices split into batches
pub(crate) fn shuffled_batches<R: Rng>(n: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    order.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}
