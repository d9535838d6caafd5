//! Downstream actuation sinks for frozen sessions
//!
//! Once a session is frozen the controller forwards the latest prediction on
//! every tick. Sinks must not block the tick loop.

use super::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ActuationSink: Send {
    /// Forward one target vector (e.g. fx/fy/fz) downstream
    async fn send(&mut self, targets: &[f64]) -> PipelineResult<()>;

    /// Get sink type for logging
    fn sink_type(&self) -> &'static str;
}

/// Logs every command at debug level (dry-run actuation)
#[derive(Debug, Default)]
pub struct LogActuationSink {
    sent: u64,
}

impl LogActuationSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActuationSink for LogActuationSink {
    async fn send(&mut self, targets: &[f64]) -> PipelineResult<()> {
        self.sent += 1;
        log::debug!("🎯 actuation #{}: {:?}", self.sent, targets);
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "log"
    }
}

/// Forwards commands into a bounded channel with `try_send`
///
/// A full channel drops the command; the next tick sends a fresher one.
pub struct ChannelActuationSink {
    tx: mpsc::Sender<Vec<f64>>,
}

impl ChannelActuationSink {
    pub fn new(tx: mpsc::Sender<Vec<f64>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ActuationSink for ChannelActuationSink {
    async fn send(&mut self, targets: &[f64]) -> PipelineResult<()> {
        match self.tx.try_send(targets.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("⚠️  Actuation channel full, dropping command");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "actuation channel closed",
            ))),
        }
    }

    fn sink_type(&self) -> &'static str {
        "channel"
    }
}
