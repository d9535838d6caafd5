//! Core data types for the online learning pipeline

use serde::{Deserialize, Serialize};

/// A single timestamped sensor reading with its measured targets
///
/// `prediction` is filled in by the session controller once the live
/// model has served a prediction for this sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,

    /// Raw sensor features (fixed arity per session)
    pub features: Vec<f64>,

    /// Measured targets, e.g. fx/fy/fz from the reference force sensor
    pub targets: Vec<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Vec<f64>>,
}

impl Sample {
    pub fn new(timestamp_ms: i64, features: Vec<f64>, targets: Vec<f64>) -> Self {
        Self {
            timestamp_ms,
            features,
            targets,
            prediction: None,
        }
    }
}

/// Lifecycle events delivered next to the sample stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

/// One line of the inbound transport
///
/// Samples and lifecycle events share a single ordered stream so a
/// disconnect is applied after exactly the samples sent before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportMessage {
    Event { event: SessionEvent },
    Sample(Sample),
}

impl From<Sample> for TransportMessage {
    fn from(sample: Sample) -> Self {
        TransportMessage::Sample(sample)
    }
}

impl From<SessionEvent> for TransportMessage {
    fn from(event: SessionEvent) -> Self {
        TransportMessage::Event { event }
    }
}

/// Session mode as seen from outside the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No client connected
    Idle,
    /// Connected, within the learning time budget
    Learning,
    /// Connected, training permanently disabled for this session
    Frozen,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Learning => "learning",
            SessionState::Frozen => "frozen",
        }
    }
}

/// Helper to get current Unix timestamp in milliseconds
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
