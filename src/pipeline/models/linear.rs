//! Multi-output ridge regression solved in closed form

use super::mean_squared_error;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::regressor::{
    check_fit_shapes, check_parameter_len, check_predict_shape, FitSummary, Regressor,
};
use ndarray::{concatenate, s, Array2, Axis};

const RIDGE_LAMBDA: f64 = 1e-6;

/// Linear model `y = [x, 1] · W`
///
/// `W` is `(n_inputs + 1) x n_outputs`; the last row holds the biases.
/// `parameters()` flattens it row-major.
#[derive(Debug, Clone)]
pub struct LinearRegressor {
    n_inputs: usize,
    n_outputs: usize,
    weights: Array2<f64>,
}

impl LinearRegressor {
    pub fn new(n_inputs: usize, n_outputs: usize) -> PipelineResult<Self> {
        if n_inputs == 0 || n_outputs == 0 {
            return Err(PipelineError::Configuration(format!(
                "linear regressor needs positive arities, got {} -> {}",
                n_inputs, n_outputs
            )));
        }
        Ok(Self {
            n_inputs,
            n_outputs,
            weights: Array2::zeros((n_inputs + 1, n_outputs)),
        })
    }
}

/// Append a column of ones for the bias term
fn design(x: &Array2<f64>) -> PipelineResult<Array2<f64>> {
    let ones = Array2::<f64>::ones((x.nrows(), 1));
    Ok(concatenate(Axis(1), &[x.view(), ones.view()])?)
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting
///
/// `a` is `d x d`, `b` is `d x k`; both are consumed as scratch space.
fn solve(mut a: Array2<f64>, mut b: Array2<f64>) -> PipelineResult<Array2<f64>> {
    let d = a.nrows();
    for col in 0..d {
        let pivot = (col..d)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);
        if a[[pivot, col]].abs() < 1e-12 {
            return Err(PipelineError::Training("singular normal equations".to_string()));
        }
        if pivot != col {
            for c in 0..d {
                a.swap([col, c], [pivot, c]);
            }
            for c in 0..b.ncols() {
                b.swap([col, c], [pivot, c]);
            }
        }

        let pivot_row = a.row(col).to_owned();
        let pivot_rhs = b.row(col).to_owned();
        for row in col + 1..d {
            let factor = a[[row, col]] / pivot_row[col];
            if factor == 0.0 {
                continue;
            }
            a.row_mut(row).scaled_add(-factor, &pivot_row);
            b.row_mut(row).scaled_add(-factor, &pivot_rhs);
        }
    }

    let mut x = Array2::<f64>::zeros(b.raw_dim());
    for row in (0..d).rev() {
        // b[row] - a[row, row+1..] · x[row+1..]
        let tail = a.slice(s![row, row + 1..]).dot(&x.slice(s![row + 1.., ..]));
        let solved = (&b.row(row) - &tail) / a[[row, row]];
        x.row_mut(row).assign(&solved);
    }
    Ok(x)
}

impl Regressor for LinearRegressor {
    fn fit(&mut self, x: &Array2<f64>, y: &Array2<f64>) -> PipelineResult<FitSummary> {
        check_fit_shapes(x, y, self.n_inputs, self.n_outputs)?;

        let xa = design(x)?;
        let mut xtx = xa.t().dot(&xa);
        let xty = xa.t().dot(y);
        let ridge = RIDGE_LAMBDA * x.nrows() as f64;
        for i in 0..self.n_inputs {
            xtx[[i, i]] += ridge;
        }

        let weights = solve(xtx, xty)?;
        if weights.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Training("non-finite ridge solution".to_string()));
        }

        let final_loss = mean_squared_error(&xa.dot(&weights), y);
        self.weights = weights;
        Ok(FitSummary {
            epochs: 1,
            final_loss,
        })
    }

    fn predict(&self, x: &Array2<f64>) -> PipelineResult<Array2<f64>> {
        check_predict_shape(x, self.n_inputs)?;
        if x.nrows() == 0 {
            return Ok(Array2::zeros((0, self.n_outputs)));
        }
        Ok(design(x)?.dot(&self.weights))
    }

    fn parameters(&self) -> Vec<f64> {
        self.weights.iter().copied().collect()
    }

    fn load_parameters(&mut self, params: &[f64]) -> PipelineResult<()> {
        check_parameter_len(self.weights.len(), params.len())?;
        self.weights = Array2::from_shape_vec(self.weights.raw_dim(), params.to_vec())?;
        Ok(())
    }

    fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    fn n_outputs(&self) -> usize {
        self.n_outputs
    }
}
