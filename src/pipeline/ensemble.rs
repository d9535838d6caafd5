//! Ensemble coordinator: joint or per-target managers behind one contract
//!
//! `predict()` always returns `[n, target_arity]`. `start()` splits the
//! targets by owning manager; each manager decides on its own whether to
//! accept or skip the round. A batch whose shape does not match the
//! ensemble is rejected before any manager sees it.

use super::config::PipelineConfig;
use super::error::{PipelineError, PipelineResult};
use super::manager::{ManagerSettings, ManagerStats, ModelManager};
use super::regressor::{Model, Regressor};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// One manager producing every target
    Joint,
    /// One manager per target, each producing a scalar
    PerTarget,
}

pub enum Ensemble<R: Regressor + Clone = Model> {
    Joint(ModelManager<R>),
    PerTarget(Vec<ModelManager<R>>),
}

impl Ensemble<Model> {
    /// Build the configured topology and model family
    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        let settings = ManagerSettings {
            tau: config.tau,
            close_warn_after: config.close_warn_after,
        };
        let topology = if config.single_model {
            Topology::Joint
        } else {
            Topology::PerTarget
        };
        Self::build(topology, config.feature_arity, config.target_arity, settings, |n_outputs| {
            Model::from_config(config, n_outputs)
        })
    }
}

impl<R: Regressor + Clone> Ensemble<R> {
    /// Build managers with `make_model(n_outputs)`
    pub fn build<F>(
        topology: Topology,
        feature_arity: usize,
        target_arity: usize,
        settings: ManagerSettings,
        mut make_model: F,
    ) -> PipelineResult<Self>
    where
        F: FnMut(usize) -> PipelineResult<R>,
    {
        match topology {
            Topology::Joint => {
                let model = make_model(target_arity)?;
                Ok(Ensemble::Joint(ModelManager::new(
                    "joint",
                    model,
                    feature_arity,
                    target_arity,
                    settings,
                )?))
            }
            Topology::PerTarget => {
                let managers = (0..target_arity)
                    .map(|t| {
                        let model = make_model(1)?;
                        ModelManager::new(format!("target_{}", t), model, feature_arity, 1, settings.clone())
                    })
                    .collect::<PipelineResult<Vec<_>>>()?;
                Ok(Ensemble::PerTarget(managers))
            }
        }
    }

    pub fn topology(&self) -> Topology {
        match self {
            Ensemble::Joint(_) => Topology::Joint,
            Ensemble::PerTarget(_) => Topology::PerTarget,
        }
    }

    pub fn feature_arity(&self) -> usize {
        match self {
            Ensemble::Joint(m) => m.feature_arity(),
            Ensemble::PerTarget(ms) => ms.first().map(|m| m.feature_arity()).unwrap_or(0),
        }
    }

    pub fn target_arity(&self) -> usize {
        match self {
            Ensemble::Joint(m) => m.target_arity(),
            Ensemble::PerTarget(ms) => ms.iter().map(|m| m.target_arity()).sum(),
        }
    }

    pub fn managers(&self) -> Vec<&ModelManager<R>> {
        match self {
            Ensemble::Joint(m) => vec![m],
            Ensemble::PerTarget(ms) => ms.iter().collect(),
        }
    }

    /// Full per-target prediction from the Live snapshots
    pub fn predict(&self, x: &Array2<f64>) -> PipelineResult<Array2<f64>> {
        match self {
            Ensemble::Joint(m) => m.predict(x),
            Ensemble::PerTarget(ms) => {
                let columns = ms
                    .iter()
                    .map(|m| m.predict(x))
                    .collect::<PipelineResult<Vec<_>>>()?;
                let views: Vec<ArrayView2<f64>> = columns.iter().map(|c| c.view()).collect();
                Ok(concatenate(Axis(1), &views)?)
            }
        }
    }

    /// Dispatch a training window; returns how many managers accepted it
    ///
    /// Fails with `Configuration` when `x` or `y` does not have the
    /// ensemble's arities.
    pub fn start(&self, x: &Array2<f64>, y: &Array2<f64>) -> PipelineResult<usize> {
        if x.ncols() != self.feature_arity() || y.ncols() != self.target_arity() || x.nrows() != y.nrows() {
            return Err(PipelineError::Configuration(format!(
                "training batch [{}, {}] -> [{}, {}] does not match ensemble {} -> {}",
                x.nrows(),
                x.ncols(),
                y.nrows(),
                y.ncols(),
                self.feature_arity(),
                self.target_arity()
            )));
        }

        let accepted = match self {
            Ensemble::Joint(m) => usize::from(m.start(x.clone(), y.clone())),
            Ensemble::PerTarget(ms) => ms
                .iter()
                .enumerate()
                .filter(|(t, m)| m.start(x.clone(), y.slice(s![.., *t..*t + 1]).to_owned()))
                .count(),
        };
        Ok(accepted)
    }

    pub fn is_training(&self) -> bool {
        self.managers().iter().any(|m| m.is_training())
    }

    /// Join every manager's in-flight job
    pub async fn close_all(&self) {
        for manager in self.managers() {
            manager.close().await;
        }
    }

    /// Hard-sync every manager; returns how many were synced
    pub fn hard_sync_all(&self) -> PipelineResult<usize> {
        let mut synced = 0;
        for manager in self.managers() {
            if manager.hard_sync()? {
                synced += 1;
            }
        }
        Ok(synced)
    }

    pub fn stats(&self) -> Vec<ManagerStats> {
        self.managers().iter().map(|m| m.stats()).collect()
    }
}
