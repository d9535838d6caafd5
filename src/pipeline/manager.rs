//! Model manager: live/shadow double buffering for one regressor
//!
//! ## Snapshots
//!
//! - **Live** serves `predict()`. It is only ever written under its write
//!   lock, in one `load_parameters` call, so readers see either the whole
//!   pre-merge or the whole post-merge state.
//! - **Shadow** is fitted by the single in-flight job and otherwise idle.
//!
//! ## Jobs
//!
//! `start()` never blocks and never queues: if the job slot holds a running
//! task the call is dropped. A finished fit is soft-merged into Live
//! (`tau * shadow + (1 - tau) * live`). A failed fit leaves Live untouched.
//! `close()` joins the in-flight job (warning once the configured bound is
//! exceeded) and is a no-op when nothing is running.

use super::error::{PipelineError, PipelineResult};
use super::regressor::Regressor;
use ndarray::Array2;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Training,
}

/// Settings shared by every manager of an ensemble
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub tau: f64,
    pub close_warn_after: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            tau: 0.95,
            close_warn_after: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct JobCounters {
    started: AtomicU64,
    skipped: AtomicU64,
    merged: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of a manager's job counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub started: u64,
    pub skipped: u64,
    pub merged: u64,
    pub failed: u64,
}

/// Element-wise `tau * shadow + (1 - tau) * live`
pub fn soft_merge(tau: f64, shadow: &[f64], live: &[f64]) -> PipelineResult<Vec<f64>> {
    if shadow.len() != live.len() {
        return Err(PipelineError::Configuration(format!(
            "cannot merge parameter vectors of length {} and {}",
            shadow.len(),
            live.len()
        )));
    }
    Ok(shadow
        .iter()
        .zip(live)
        .map(|(s, l)| tau * s + (1.0 - tau) * l)
        .collect())
}

pub struct ModelManager<R: Regressor + Clone> {
    name: String,
    feature_arity: usize,
    target_arity: usize,
    live: Arc<RwLock<R>>,
    shadow: Arc<Mutex<R>>,
    job: Mutex<Option<JoinHandle<()>>>,
    settings: ManagerSettings,
    counters: Arc<JobCounters>,
}

impl<R: Regressor + Clone> ModelManager<R> {
    /// Create a manager whose Live and Shadow start from the same parameters
    ///
    /// Fails with `Configuration` when the model's arities differ from the
    /// expected ones or `tau` is outside `(0, 1]`.
    pub fn new(
        name: impl Into<String>,
        model: R,
        feature_arity: usize,
        target_arity: usize,
        settings: ManagerSettings,
    ) -> PipelineResult<Self> {
        let name = name.into();
        if model.n_inputs() != feature_arity || model.n_outputs() != target_arity {
            return Err(PipelineError::Configuration(format!(
                "manager {}: model is {} -> {}, expected {} -> {}",
                name,
                model.n_inputs(),
                model.n_outputs(),
                feature_arity,
                target_arity
            )));
        }
        if !(settings.tau > 0.0 && settings.tau <= 1.0) {
            return Err(PipelineError::Configuration(format!(
                "manager {}: tau must be in (0, 1], got {}",
                name, settings.tau
            )));
        }

        Ok(Self {
            name,
            feature_arity,
            target_arity,
            shadow: Arc::new(Mutex::new(model.clone())),
            live: Arc::new(RwLock::new(model)),
            job: Mutex::new(None),
            settings,
            counters: Arc::new(JobCounters::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature_arity(&self) -> usize {
        self.feature_arity
    }

    pub fn target_arity(&self) -> usize {
        self.target_arity
    }

    fn job_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.job.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ManagerState {
        match self.job_slot().as_ref() {
            Some(handle) if !handle.is_finished() => ManagerState::Training,
            _ => ManagerState::Idle,
        }
    }

    pub fn is_training(&self) -> bool {
        self.state() == ManagerState::Training
    }

    /// Launch a background fit on `(x, y)` unless one is already running
    ///
    /// Returns `true` when a job was launched. Must be called from within a
    /// tokio runtime.
    pub fn start(&self, x: Array2<f64>, y: Array2<f64>) -> bool {
        let mut slot = self.job_slot();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!("⏭️  {}: training in flight, skipping {} samples", self.name, x.nrows());
                return false;
            }
        }

        let name = self.name.clone();
        let live = Arc::clone(&self.live);
        let shadow = Arc::clone(&self.shadow);
        let counters = Arc::clone(&self.counters);
        let tau = self.settings.tau;

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        *slot = Some(tokio::task::spawn_blocking(move || {
            run_job(&name, &live, &shadow, &counters, tau, x, y);
        }));
        true
    }

    /// Predict with the Live snapshot; safe while a job is in flight
    pub fn predict(&self, x: &Array2<f64>) -> PipelineResult<Array2<f64>> {
        let live = self.live.read().unwrap_or_else(|e| e.into_inner());
        live.predict(x)
    }

    /// Replace Live wholesale with Shadow, bypassing the soft merge
    ///
    /// Returns `Ok(false)` without touching Live while a job is in flight;
    /// callers join with `close()` first.
    pub fn hard_sync(&self) -> PipelineResult<bool> {
        if self.is_training() {
            log::warn!("⚠️  {}: hard sync skipped, training in flight", self.name);
            return Ok(false);
        }
        let params = {
            let shadow = self.shadow.lock().unwrap_or_else(|e| e.into_inner());
            shadow.parameters()
        };
        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        live.load_parameters(&params)?;
        log::info!("🔁 {}: live model hard-synced to shadow", self.name);
        Ok(true)
    }

    /// Wait for the in-flight job (if any) to finish
    ///
    /// Logs a `ShutdownTimeout` warning once `close_warn_after` has passed
    /// but keeps waiting. Calling it again with nothing running returns
    /// immediately.
    pub async fn close(&self) {
        let handle = self.job_slot().take();
        let Some(mut handle) = handle else {
            return;
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.settings.close_warn_after, &mut handle).await {
            Ok(result) => result,
            Err(_) => {
                let err = PipelineError::ShutdownTimeout {
                    waited_ms: self.settings.close_warn_after.as_millis() as u64,
                };
                log::warn!("⏳ {}: {}; still waiting", self.name, err);
                handle.await
            }
        };

        if let Err(e) = result {
            log::error!("❌ {}: training job aborted: {}", self.name, e);
        }
        log::debug!("{}: closed after {}ms", self.name, started.elapsed().as_millis());
    }

    pub fn live_parameters(&self) -> Vec<f64> {
        self.live.read().unwrap_or_else(|e| e.into_inner()).parameters()
    }

    /// Shadow parameters, or `None` while a job holds the shadow
    pub fn shadow_parameters(&self) -> Option<Vec<f64>> {
        self.shadow.try_lock().ok().map(|shadow| shadow.parameters())
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            started: self.counters.started.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            merged: self.counters.merged.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Body of one background job: fit Shadow, then soft-merge into Live
fn run_job<R: Regressor>(
    name: &str,
    live: &RwLock<R>,
    shadow: &Mutex<R>,
    counters: &JobCounters,
    tau: f64,
    x: Array2<f64>,
    y: Array2<f64>,
) {
    log::info!(
        "🧠 {}: training on x [{}, {}], y [{}, {}]",
        name,
        x.nrows(),
        x.ncols(),
        y.nrows(),
        y.ncols()
    );
    let started = Instant::now();

    let mut shadow = shadow.lock().unwrap_or_else(|e| e.into_inner());
    let summary = match shadow.fit(&x, &y) {
        Ok(summary) => summary,
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("❌ {}: {}; live model unchanged", name, e);
            return;
        }
    };
    let shadow_params = shadow.parameters();
    drop(shadow);

    let merged = {
        let mut live = live.write().unwrap_or_else(|e| e.into_inner());
        soft_merge(tau, &shadow_params, &live.parameters()).and_then(|blended| live.load_parameters(&blended))
    };

    match merged {
        Ok(()) => {
            counters.merged.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "✅ {}: trained {} epochs, loss {:.6}, merged (tau {}) in {:.2}s",
                name,
                summary.epochs,
                summary.final_loss,
                tau,
                started.elapsed().as_secs_f64()
            );
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("❌ {}: merge failed: {}", name, e);
        }
    }
}
