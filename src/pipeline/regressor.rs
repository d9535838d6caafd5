//! Regressor capability shared by every model family
//!
//! Managers only ever talk to a regressor through this trait: fit on a
//! batch, predict a batch, and export/import a flat parameter vector for the
//! live/shadow merge. The set of families is closed (`Model`), selected by
//! name in the configuration.

use super::config::PipelineConfig;
use super::error::{PipelineError, PipelineResult};
use super::models::{FeedforwardRegressor, LinearRegressor};
use ndarray::Array2;
use std::str::FromStr;

/// Result of one successful fit
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub epochs: usize,
    pub final_loss: f64,
}

/// Hyperparameters for iterative fits
#[derive(Debug, Clone)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl TrainingParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            seed: config.seed,
        }
    }
}

pub trait Regressor: Send + Sync + 'static {
    /// Fit on `x: [n, n_inputs]`, `y: [n, n_outputs]`; may run arbitrarily long
    fn fit(&mut self, x: &Array2<f64>, y: &Array2<f64>) -> PipelineResult<FitSummary>;

    /// Predict `[n, n_outputs]` for `x: [n, n_inputs]`
    fn predict(&self, x: &Array2<f64>) -> PipelineResult<Array2<f64>>;

    /// Flat copy of every trainable parameter
    fn parameters(&self) -> Vec<f64>;

    /// Overwrite all trainable parameters; length must match `parameters()`
    fn load_parameters(&mut self, params: &[f64]) -> PipelineResult<()>;

    fn n_inputs(&self) -> usize;

    fn n_outputs(&self) -> usize;
}

/// Shape checks shared by every regressor
pub(crate) fn check_fit_shapes(
    x: &Array2<f64>,
    y: &Array2<f64>,
    n_inputs: usize,
    n_outputs: usize,
) -> PipelineResult<()> {
    if x.nrows() == 0 {
        return Err(PipelineError::Training("empty training batch".to_string()));
    }
    if x.nrows() != y.nrows() {
        return Err(PipelineError::Training(format!(
            "feature rows ({}) != target rows ({})",
            x.nrows(),
            y.nrows()
        )));
    }
    if x.ncols() != n_inputs || y.ncols() != n_outputs {
        return Err(PipelineError::Training(format!(
            "batch shape [{}, {}] -> [{}, {}] does not match model {} -> {}",
            x.nrows(),
            x.ncols(),
            y.nrows(),
            y.ncols(),
            n_inputs,
            n_outputs
        )));
    }
    if !x.iter().chain(y.iter()).all(|v| v.is_finite()) {
        return Err(PipelineError::Training("non-finite values in training batch".to_string()));
    }
    Ok(())
}

pub(crate) fn check_predict_shape(x: &Array2<f64>, n_inputs: usize) -> PipelineResult<()> {
    if x.nrows() > 0 && x.ncols() != n_inputs {
        return Err(PipelineError::Configuration(format!(
            "prediction input has {} features, model expects {}",
            x.ncols(),
            n_inputs
        )));
    }
    Ok(())
}

pub(crate) fn check_parameter_len(expected: usize, got: usize) -> PipelineResult<()> {
    if expected != got {
        return Err(PipelineError::Configuration(format!(
            "parameter vector has {} values, model expects {}",
            got, expected
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressorKind {
    Linear,
    Feedforward,
}

impl RegressorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegressorKind::Linear => "linear",
            RegressorKind::Feedforward => "feedforward",
        }
    }
}

impl FromStr for RegressorKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" | "ridge" => Ok(RegressorKind::Linear),
            "feedforward" | "fnn" | "mlp" => Ok(RegressorKind::Feedforward),
            other => Err(PipelineError::Configuration(format!(
                "unknown model family: {}",
                other
            ))),
        }
    }
}

/// Closed set of model families served by the pipeline
#[derive(Debug, Clone)]
pub enum Model {
    Linear(LinearRegressor),
    Feedforward(FeedforwardRegressor),
}

impl Model {
    /// Build the configured family for `n_outputs` targets
    pub fn from_config(config: &PipelineConfig, n_outputs: usize) -> PipelineResult<Self> {
        let params = TrainingParams::from_config(config);
        match config.model {
            RegressorKind::Linear => Ok(Model::Linear(LinearRegressor::new(
                config.feature_arity,
                n_outputs,
            )?)),
            RegressorKind::Feedforward => Ok(Model::Feedforward(FeedforwardRegressor::new(
                config.feature_arity,
                n_outputs,
                &config.hidden_dims,
                params,
            )?)),
        }
    }

    pub fn kind(&self) -> RegressorKind {
        match self {
            Model::Linear(_) => RegressorKind::Linear,
            Model::Feedforward(_) => RegressorKind::Feedforward,
        }
    }
}

impl Regressor for Model {
    fn fit(&mut self, x: &Array2<f64>, y: &Array2<f64>) -> PipelineResult<FitSummary> {
        match self {
            Model::Linear(m) => m.fit(x, y),
            Model::Feedforward(m) => m.fit(x, y),
        }
    }

    fn predict(&self, x: &Array2<f64>) -> PipelineResult<Array2<f64>> {
        match self {
            Model::Linear(m) => m.predict(x),
            Model::Feedforward(m) => m.predict(x),
        }
    }

    fn parameters(&self) -> Vec<f64> {
        match self {
            Model::Linear(m) => m.parameters(),
            Model::Feedforward(m) => m.parameters(),
        }
    }

    fn load_parameters(&mut self, params: &[f64]) -> PipelineResult<()> {
        match self {
            Model::Linear(m) => m.load_parameters(params),
            Model::Feedforward(m) => m.load_parameters(params),
        }
    }

    fn n_inputs(&self) -> usize {
        match self {
            Model::Linear(m) => m.n_inputs(),
            Model::Feedforward(m) => m.n_inputs(),
        }
    }

    fn n_outputs(&self) -> usize {
        match self {
            Model::Linear(m) => m.n_outputs(),
            Model::Feedforward(m) => m.n_outputs(),
        }
    }
}
