//! Tick loop driving the session controller
//!
//! The loop ticks at a fixed cadence until the shutdown future resolves or
//! the transport closes the inbound channel, then finalizes any open
//! session (persist + join) before returning.

use super::regressor::Regressor;
use super::session::SessionController;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

/// Run the control loop; returns the controller once stopped
pub async fn run_session_loop<R, F>(
    mut controller: SessionController<R>,
    tick_interval: Duration,
    shutdown: F,
) -> SessionController<R>
where
    R: Regressor + Clone,
    F: Future<Output = ()>,
{
    log::info!("🚀 Starting session loop (tick every {}ms)", tick_interval.as_millis());

    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut sample_count = 0u64;
    let mut last_log_time = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = controller.tick().await;
                sample_count += report.drained as u64;

                // Log throughput every 10 seconds
                if last_log_time.elapsed().as_secs() >= 10 {
                    let rate = sample_count as f64 / last_log_time.elapsed().as_secs_f64();
                    let (trained_until, predicted_until) = controller.cursors();
                    log::info!(
                        "📊 {} | {:.1} samples/sec | store: {} | trained: {} | predicted: {}",
                        controller.state().as_str(),
                        rate,
                        controller.store().len(),
                        trained_until,
                        predicted_until
                    );
                    last_log_time = Instant::now();
                    sample_count = 0;
                }

                if controller.inputs_closed() {
                    log::warn!("⚠️  Transport closed, stopping session loop");
                    break;
                }
            }

            _ = &mut shutdown => {
                log::info!("⚠️  Shutdown requested");
                break;
            }
        }
    }

    controller.shutdown().await;
    log::info!("✅ Session loop stopped");
    controller
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ensemble::{Ensemble, Topology};
    use crate::pipeline::manager::ManagerSettings;
    use crate::pipeline::models::LinearRegressor;
    use crate::pipeline::session::SessionSettings;
    use crate::pipeline::types::{Sample, SessionEvent, SessionState, TransportMessage};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_loop_stops_when_transport_closes() {
        let settings = SessionSettings {
            feature_arity: 2,
            target_arity: 1,
            required_samples: 5,
            max_samples: 100,
            learning_time: Duration::from_secs(60),
            feature_scale: 1.0,
        };
        let ensemble = Ensemble::build(Topology::Joint, 2, 1, ManagerSettings::default(), |n| {
            LinearRegressor::new(2, n)
        })
        .unwrap();
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportMessage>(100);
        let controller = SessionController::new(settings, ensemble, inbound_rx).unwrap();

        let producer = tokio::spawn(async move {
            inbound_tx.send(SessionEvent::Connected.into()).await.unwrap();
            for i in 0..20 {
                let x = i as f64;
                inbound_tx
                    .send(Sample::new(i, vec![x, 1.0 - x], vec![3.0 * x]).into())
                    .await
                    .unwrap();
            }
            // sender dropped here
        });

        let controller = tokio::time::timeout(
            Duration::from_secs(5),
            run_session_loop(controller, Duration::from_millis(5), std::future::pending::<()>()),
        )
        .await
        .unwrap();
        producer.await.unwrap();

        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(controller.sessions_started(), 1);
        assert!(!controller.ensemble().is_training());
    }
}
