//! Error taxonomy for the online learning pipeline
//!
//! Ingestion and training failures are contained where they happen (logged,
//! never surfaced to the tick loop). Configuration errors fail fast at
//! construction. `ShutdownTimeout` is only ever logged as a warning.

#[derive(Debug)]
pub enum PipelineError {
    /// Malformed or missing sample (dropped by the caller)
    Ingestion(String),
    /// Numerical or shape failure inside a fit
    Training(String),
    /// Arity mismatch or invalid setting at construction time
    Configuration(String),
    /// `close()` exceeded its warning bound (still joined afterwards)
    ShutdownTimeout { waited_ms: u64 },
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Database(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err)
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(err.to_string())
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(err: ndarray::ShapeError) -> Self {
        PipelineError::Configuration(format!("shape mismatch: {}", err))
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Ingestion(e) => write!(f, "Ingestion error: {}", e),
            PipelineError::Training(e) => write!(f, "Training failure: {}", e),
            PipelineError::Configuration(e) => write!(f, "Configuration error: {}", e),
            PipelineError::ShutdownTimeout { waited_ms } => {
                write!(f, "Shutdown timeout: training job still running after {}ms", waited_ms)
            }
            PipelineError::Io(e) => write!(f, "IO error: {}", e),
            PipelineError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PipelineError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}
