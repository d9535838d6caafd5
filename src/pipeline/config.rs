//! Pipeline configuration from environment variables

use super::error::{PipelineError, PipelineResult};
use super::regressor::RegressorKind;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Json,
    Sqlite,
}

/// Configuration for the online learning runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of sensor features per sample
    pub feature_arity: usize,

    /// Number of regression targets per sample
    pub target_arity: usize,

    /// New samples needed before a training window is dispatched
    pub required_samples: usize,

    /// Upper bound on samples per training window
    pub max_samples: usize,

    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,

    /// Learning budget per session before switching to frozen mode
    pub learning_time: Duration,

    /// Regressor family used by every manager
    pub model: RegressorKind,

    /// One joint manager (true) or one manager per target (false)
    pub single_model: bool,

    /// Soft merge weight of the freshly trained shadow parameters
    pub tau: f64,

    /// Hidden layer widths for the feedforward regressor
    pub hidden_dims: Vec<usize>,

    /// Features are divided by this before fit and predict
    pub feature_scale: f64,

    pub tick_interval_ms: u64,
    pub channel_buffer: usize,

    /// `close()` logs a shutdown warning after this long
    pub close_warn_after: Duration,

    /// Directory (json) or database file (sqlite) for finished sessions
    pub data_path: String,
    pub storage_backend: StorageBackend,
    pub save_data: bool,

    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feature_arity: 4,
            target_arity: 3,
            required_samples: 40,
            max_samples: 1000,
            epochs: 10,
            batch_size: 32,
            learning_rate: 0.001,
            learning_time: Duration::from_secs(60),
            model: RegressorKind::Feedforward,
            single_model: true,
            tau: 0.95,
            hidden_dims: vec![16, 16, 16],
            feature_scale: 1.0,
            tick_interval_ms: 20,
            channel_buffer: 10_000,
            close_warn_after: Duration::from_millis(5_000),
            data_path: "data".to_string(),
            storage_backend: StorageBackend::Json,
            save_data: true,
            seed: 42,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TL_FEATURE_ARITY` (default: 4), `TL_TARGET_ARITY` (default: 3)
    /// - `TL_REQUIRED_SAMPLES` (default: 40), `TL_MAX_SAMPLES` (default: 1000)
    /// - `TL_EPOCHS` (default: 10), `TL_BATCH_SIZE` (default: 32)
    /// - `TL_LEARNING_RATE` (default: 0.001)
    /// - `TL_LEARNING_TIME_SECS` (default: 60)
    /// - `TL_MODEL` (default: feedforward)
    /// - `TL_SINGLE_MODEL` (default: true)
    /// - `TL_TAU` (default: 0.95)
    /// - `TL_HIDDEN_DIMS` (default: 16,16,16)
    /// - `TL_FEATURE_SCALE` (default: 1.0)
    /// - `TL_TICK_INTERVAL_MS` (default: 20)
    /// - `TL_CHANNEL_BUFFER` (default: 10000)
    /// - `TL_CLOSE_WARN_MS` (default: 5000)
    /// - `TL_DATA_PATH` (default: data)
    /// - `TL_STORAGE_BACKEND` (default: json)
    /// - `TL_SAVE_DATA` (default: true)
    /// - `TL_SEED` (default: 42)
    pub fn from_env() -> PipelineResult<Self> {
        let defaults = Self::default();

        let model = match env::var("TL_MODEL") {
            Ok(name) => name.parse::<RegressorKind>()?,
            Err(_) => defaults.model,
        };

        let storage_backend = match env::var("TL_STORAGE_BACKEND")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("sqlite") => StorageBackend::Sqlite,
            Ok("json") | Err(_) => StorageBackend::Json,
            Ok(other) => {
                return Err(PipelineError::Configuration(format!(
                    "unknown storage backend: {}",
                    other
                )))
            }
        };

        let hidden_dims = match env::var("TL_HIDDEN_DIMS") {
            Ok(s) => s
                .split(',')
                .map(|d| d.trim())
                .filter(|d| !d.is_empty())
                .map(|d| {
                    d.parse::<usize>().map_err(|_| {
                        PipelineError::Configuration(format!("invalid hidden dim: {}", d))
                    })
                })
                .collect::<PipelineResult<Vec<_>>>()?,
            Err(_) => defaults.hidden_dims.clone(),
        };

        let config = Self {
            feature_arity: parse_var("TL_FEATURE_ARITY", defaults.feature_arity),
            target_arity: parse_var("TL_TARGET_ARITY", defaults.target_arity),
            required_samples: parse_var("TL_REQUIRED_SAMPLES", defaults.required_samples),
            max_samples: parse_var("TL_MAX_SAMPLES", defaults.max_samples),
            epochs: parse_var("TL_EPOCHS", defaults.epochs),
            batch_size: parse_var("TL_BATCH_SIZE", defaults.batch_size),
            learning_rate: parse_var("TL_LEARNING_RATE", defaults.learning_rate),
            learning_time: Duration::from_secs(parse_var(
                "TL_LEARNING_TIME_SECS",
                defaults.learning_time.as_secs(),
            )),
            model,
            single_model: parse_var("TL_SINGLE_MODEL", defaults.single_model),
            tau: parse_var("TL_TAU", defaults.tau),
            hidden_dims,
            feature_scale: parse_var("TL_FEATURE_SCALE", defaults.feature_scale),
            tick_interval_ms: parse_var("TL_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            channel_buffer: parse_var("TL_CHANNEL_BUFFER", defaults.channel_buffer),
            close_warn_after: Duration::from_millis(parse_var(
                "TL_CLOSE_WARN_MS",
                defaults.close_warn_after.as_millis() as u64,
            )),
            data_path: env::var("TL_DATA_PATH").unwrap_or(defaults.data_path),
            storage_backend,
            save_data: parse_var("TL_SAVE_DATA", defaults.save_data),
            seed: parse_var("TL_SEED", defaults.seed),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make managers or the session loop misbehave
    pub fn validate(&self) -> PipelineResult<()> {
        let fail = |msg: String| Err(PipelineError::Configuration(msg));

        if self.feature_arity == 0 || self.target_arity == 0 {
            return fail(format!(
                "arities must be positive (features: {}, targets: {})",
                self.feature_arity, self.target_arity
            ));
        }
        if !(self.tau > 0.0 && self.tau <= 1.0) {
            return fail(format!("tau must be in (0, 1], got {}", self.tau));
        }
        if self.required_samples == 0 {
            return fail("required_samples must be positive".to_string());
        }
        if self.max_samples < self.required_samples {
            return fail(format!(
                "max_samples ({}) must be >= required_samples ({})",
                self.max_samples, self.required_samples
            ));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return fail("epochs and batch_size must be positive".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning rate must be positive, got {}", self.learning_rate));
        }
        if !(self.feature_scale.is_finite() && self.feature_scale != 0.0) {
            return fail(format!("feature scale must be non-zero, got {}", self.feature_scale));
        }
        if self.tick_interval_ms == 0 || self.channel_buffer == 0 {
            return fail("tick interval and channel buffer must be positive".to_string());
        }
        Ok(())
    }
}
