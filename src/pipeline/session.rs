//! Session controller - per-client state machine driven by the tick loop
//!
//! ## States
//!
//! ```text
//!            connected                 learning budget exceeded
//!   Idle ──────────────▶ Learning ───────────────────────────▶ Frozen
//!    ▲                      │                                     │
//!    └──────────────────────┴──────────── disconnected ◀──────────┘
//! ```
//!
//! ## Per tick
//!
//! 1. Drain the inbound channel (non-blocking) in arrival order: samples
//!    go into the store, `connected` opens a session, `disconnected`
//!    predicts what is left, persists and closes it. Samples arriving
//!    while idle are discarded.
//! 2. Predict `[predicted_until, len)` from the Live snapshots
//! 3. Frozen: forward the latest prediction to the actuation sink, stop
//! 4. Learning: once `len - trained_until >= required_samples`, dispatch
//!    the training window and advance `trained_until` to `len` whether or
//!    not the managers accepted it
//!
//! Training failures stay inside the managers; nothing here returns an
//! error to the caller.

use super::actuation::ActuationSink;
use super::config::PipelineConfig;
use super::ensemble::Ensemble;
use super::error::{PipelineError, PipelineResult};
use super::persistence::SampleSink;
use super::regressor::{Model, Regressor};
use super::store::SampleStore;
use super::types::{current_timestamp_ms, Sample, SessionEvent, SessionState, TransportMessage};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Settings the controller needs from the pipeline configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub feature_arity: usize,
    pub target_arity: usize,
    pub required_samples: usize,
    pub max_samples: usize,
    pub learning_time: Duration,
    pub feature_scale: f64,
}

impl SessionSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            feature_arity: config.feature_arity,
            target_arity: config.target_arity,
            required_samples: config.required_samples,
            max_samples: config.max_samples,
            learning_time: config.learning_time,
            feature_scale: config.feature_scale,
        }
    }
}

/// What happened during one tick (for logging and tests)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub drained: usize,
    pub dropped: usize,
    /// Samples received while no session was active
    pub discarded: usize,
    pub predicted: usize,
    /// Training window dispatched this tick, if any
    pub dispatched: Option<std::ops::Range<usize>>,
    /// Managers that accepted the dispatched window
    pub accepted: usize,
    pub froze: bool,
    pub actuated: bool,
}

pub struct SessionController<R: Regressor + Clone = Model> {
    settings: SessionSettings,
    store: SampleStore,
    ensemble: Ensemble<R>,

    inbound_rx: mpsc::Receiver<TransportMessage>,
    inbound_closed: bool,

    sink: Option<Box<dyn SampleSink>>,
    actuation: Option<Box<dyn ActuationSink>>,

    state: SessionState,
    start_time_ms: i64,
    last_prediction: Option<Vec<f64>>,
    sessions_started: u64,

    /// Timestamp function in unix millis (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl<R: Regressor + Clone> SessionController<R> {
    /// Fails with `Configuration` when the settings' arities differ from
    /// the ensemble's
    pub fn new(
        settings: SessionSettings,
        ensemble: Ensemble<R>,
        inbound_rx: mpsc::Receiver<TransportMessage>,
    ) -> PipelineResult<Self> {
        if settings.feature_arity != ensemble.feature_arity()
            || settings.target_arity != ensemble.target_arity()
        {
            return Err(PipelineError::Configuration(format!(
                "session expects {} -> {} but the ensemble maps {} -> {}",
                settings.feature_arity,
                settings.target_arity,
                ensemble.feature_arity(),
                ensemble.target_arity()
            )));
        }
        if settings.required_samples == 0 {
            return Err(PipelineError::Configuration(
                "required_samples must be positive".to_string(),
            ));
        }

        Ok(Self {
            store: SampleStore::with_capacity(settings.max_samples),
            settings,
            ensemble,
            inbound_rx,
            inbound_closed: false,
            sink: None,
            actuation: None,
            state: SessionState::Idle,
            start_time_ms: 0,
            last_prediction: None,
            sessions_started: 0,
            now_fn: Box::new(current_timestamp_ms),
        })
    }

    /// Persist finished sessions to `sink`
    pub fn with_sink(mut self, sink: Box<dyn SampleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Forward predictions to `actuation` once frozen
    pub fn with_actuation(mut self, actuation: Box<dyn ActuationSink>) -> Self {
        self.actuation = Some(actuation);
        self
    }

    /// Replace the clock (unix millis); used for deterministic tests
    pub fn with_now_fn(mut self, now_fn: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn ensemble(&self) -> &Ensemble<R> {
        &self.ensemble
    }

    /// `(trained_until, predicted_until)`
    pub fn cursors(&self) -> (usize, usize) {
        (self.store.trained_until(), self.store.predicted_until())
    }

    pub fn last_prediction(&self) -> Option<&[f64]> {
        self.last_prediction.as_deref()
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started
    }

    /// The transport has closed the inbound channel
    pub fn inputs_closed(&self) -> bool {
        self.inbound_closed
    }

    /// Run one iteration of the control loop
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        self.drain_inbound(&mut report).await;
        if report.discarded > 0 {
            log::debug!("Discarded {} samples received outside a session", report.discarded);
        }

        if self.state == SessionState::Idle {
            return report;
        }

        self.refresh_predictions(&mut report);

        if self.state == SessionState::Learning && self.learning_budget_exceeded() {
            self.freeze().await;
            report.froze = true;
        }

        if self.state == SessionState::Frozen {
            report.actuated = self.actuate().await;
            return report;
        }

        self.dispatch_training(&mut report);
        report
    }

    async fn drain_inbound(&mut self, report: &mut TickReport) {
        loop {
            match self.inbound_rx.try_recv() {
                Ok(TransportMessage::Sample(sample)) => self.ingest(sample, report),
                Ok(TransportMessage::Event { event }) => self.apply_event(event, report).await,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.inbound_closed {
                        log::warn!("⚠️  Inbound channel closed");
                        self.inbound_closed = true;
                    }
                    break;
                }
            }
        }
    }

    async fn apply_event(&mut self, event: SessionEvent, report: &mut TickReport) {
        match event {
            SessionEvent::Connected => {
                if self.state == SessionState::Idle {
                    self.begin_session();
                } else {
                    log::debug!("Ignoring connected event, session already active");
                }
            }
            SessionEvent::Disconnected => {
                if self.state != SessionState::Idle {
                    self.refresh_predictions(report);
                    self.end_session().await;
                } else {
                    log::debug!("Ignoring disconnected event, no active session");
                }
            }
        }
    }

    fn ingest(&mut self, sample: Sample, report: &mut TickReport) {
        if self.state == SessionState::Idle {
            report.discarded += 1;
            return;
        }
        match self
            .store
            .push_checked(sample, self.settings.feature_arity, self.settings.target_arity)
        {
            Ok(()) => report.drained += 1,
            Err(e) => {
                report.dropped += 1;
                log::warn!("⚠️  Dropping sample: {}", e);
            }
        }
    }

    fn begin_session(&mut self) {
        self.store.clear();
        self.start_time_ms = (self.now_fn)();
        self.last_prediction = None;
        self.state = SessionState::Learning;
        self.sessions_started += 1;

        log::info!("🔌 Client connected (session #{})", self.sessions_started);
        log::info!("   ├─ Learning budget: {}s", self.settings.learning_time.as_secs());
        log::info!(
            "   └─ Training every {} samples (window <= {})",
            self.settings.required_samples,
            self.settings.max_samples
        );
    }

    /// Persist the store, join every manager, then clear session state
    async fn end_session(&mut self) {
        log::info!(
            "🔌 Client disconnected ({} samples, state: {})",
            self.store.len(),
            self.state.as_str()
        );

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = self.store.persist(sink.as_mut()).await {
                log::error!("❌ Failed to persist session via {}: {}", sink.backend_type(), e);
            }
        }

        self.ensemble.close_all().await;

        self.store.clear();
        self.start_time_ms = 0;
        self.last_prediction = None;
        self.state = SessionState::Idle;
        log::info!("✅ Session closed");
    }

    /// Apply whatever is still queued, then finish any live session and
    /// join all background work
    pub async fn shutdown(&mut self) {
        let mut report = TickReport::default();
        self.drain_inbound(&mut report).await;
        if self.state != SessionState::Idle {
            self.refresh_predictions(&mut report);
            self.end_session().await;
        } else {
            self.ensemble.close_all().await;
        }
    }

    fn refresh_predictions(&mut self, report: &mut TickReport) {
        let from = self.store.predicted_until();
        let len = self.store.len();
        if from >= len {
            return;
        }

        let prediction = self
            .store
            .features(from..len, self.settings.feature_scale)
            .and_then(|x| self.ensemble.predict(&x));

        match prediction {
            Ok(pred) => {
                if let Some(last) = pred.rows().into_iter().last() {
                    self.last_prediction = Some(last.to_vec());
                }
                self.store.record_predictions(from, &pred);
                report.predicted += pred.nrows();
                log::debug!("Predicted samples [{}, {})", from, len);
            }
            Err(e) => {
                log::warn!("⚠️  Prediction failed for [{}, {}): {}", from, len, e);
            }
        }

        self.store.advance_predicted(len);
    }

    fn learning_budget_exceeded(&self) -> bool {
        let elapsed_ms = (self.now_fn)() - self.start_time_ms;
        elapsed_ms > self.settings.learning_time.as_millis() as i64
    }

    /// One-time switch to frozen mode: join jobs and hard-sync every manager
    ///
    /// Waiting here stalls the tick loop until in-flight fits finish, so
    /// the first frozen prediction already comes from the final parameters.
    async fn freeze(&mut self) {
        log::info!("⏰ Learning time exceeded");
        log::info!("   ├─ Waiting for in-flight training");
        self.ensemble.close_all().await;

        match self.ensemble.hard_sync_all() {
            Ok(n) => log::info!("   ├─ Switched {} manager(s) to hard inference", n),
            Err(e) => log::error!("   ├─ ❌ Hard sync failed: {}", e),
        }

        if let Some(actuation) = self.actuation.as_ref() {
            log::info!("   └─ Forwarding predictions to {} actuation", actuation.sink_type());
        } else {
            log::info!("   └─ No actuation sink configured");
        }
        self.state = SessionState::Frozen;
    }

    async fn actuate(&mut self) -> bool {
        let (Some(actuation), Some(prediction)) = (self.actuation.as_mut(), self.last_prediction.as_ref()) else {
            return false;
        };
        match actuation.send(prediction).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("⚠️  Actuation via {} failed: {}", actuation.sink_type(), e);
                false
            }
        }
    }

    fn dispatch_training(&mut self, report: &mut TickReport) {
        let len = self.store.len();
        let trained_until = self.store.trained_until();
        if len - trained_until < self.settings.required_samples {
            return;
        }

        let window = self
            .store
            .training_window(trained_until, len, self.settings.max_samples);
        let batch = self
            .store
            .features(window.clone(), self.settings.feature_scale)
            .and_then(|x| self.store.targets(window.clone()).map(|y| (x, y)));

        match batch.and_then(|(x, y)| self.ensemble.start(&x, &y)) {
            Ok(accepted) => {
                log::info!(
                    "📤 Dispatched training window [{}, {}) ({} samples), accepted by {}/{} manager(s)",
                    window.start,
                    window.end,
                    window.len(),
                    accepted,
                    self.ensemble.managers().len()
                );
                report.accepted = accepted;
            }
            Err(e) => log::warn!("⚠️  Could not dispatch training window: {}", e),
        }

        // advance-on-dispatch: a window skipped by a busy manager is not retried
        self.store.advance_trained(len);
        report.dispatched = Some(window);
    }
}
