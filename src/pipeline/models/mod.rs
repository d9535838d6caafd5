//! Concrete regressor families
//!
//! - `linear` - closed-form ridge regression (multi-output)
//! - `feedforward` - ReLU MLP trained with mini-batch AdamW

pub mod feedforward;
pub mod linear;
mod optim;

pub use feedforward::FeedforwardRegressor;
pub use linear::LinearRegressor;

use ndarray::Array2;

/// Mean squared error over every output of every row
pub(crate) fn mean_squared_error(pred: &Array2<f64>, y: &Array2<f64>) -> f64 {
    (pred - y).mapv(|d| d * d).mean().unwrap_or(0.0)
}
