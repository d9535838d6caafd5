//! # Online learning pipeline
//!
//! Ingests a live stream of sensor samples, retrains a regression model in
//! the background and serves predictions to a control loop without ever
//! blocking on training.
//!
//! ## Architecture
//!
//! ```text
//! transport ──TransportMessage──▶ SessionController::tick()
//!                                   │
//!                                   ├─▶ SampleStore (append-only, cursors)
//!                                   │
//!                                   └─▶ Ensemble ──▶ ModelManager(s)
//!                                                      ├─ Live   (predict)
//!                                                      └─ Shadow (background fit)
//! ```
//!
//! Ownership is strictly nested: the controller owns the store and the
//! ensemble, the ensemble owns its managers. Nothing is a process-wide
//! singleton.
//!
//! ## Module Organization
//!
//! - `types` - Sample, lifecycle events, transport messages, session state
//! - `error` - pipeline error taxonomy
//! - `config` - environment configuration
//! - `store` - append-only sample store
//! - `persistence` - JSON / SQLite session sinks
//! - `regressor` - regressor capability and model families
//! - `models` - concrete regressors
//! - `manager` - live/shadow model manager
//! - `ensemble` - joint or per-target coordinator
//! - `actuation` - downstream actuation sinks
//! - `session` - per-client state machine
//! - `runtime` - tick loop

pub mod actuation;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod manager;
pub mod models;
pub mod persistence;
pub mod regressor;
pub mod runtime;
pub mod session;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use actuation::{ActuationSink, ChannelActuationSink, LogActuationSink};
pub use config::{PipelineConfig, StorageBackend};
pub use ensemble::{Ensemble, Topology};
pub use error::{PipelineError, PipelineResult};
pub use manager::{ManagerSettings, ManagerState, ManagerStats, ModelManager};
pub use persistence::{JsonSnapshotSink, SampleSink, SqliteSampleSink};
pub use regressor::{FitSummary, Model, Regressor, RegressorKind};
pub use runtime::run_session_loop;
pub use session::{SessionController, SessionSettings, TickReport};
pub use store::SampleStore;
pub use types::{Sample, SessionEvent, SessionState, TransportMessage};
