//! Online Runtime - serves predictions while retraining in the background
//!
//! Reads JSON lines from stdin, one message per line:
//!   {"event": "connected"} / {"event": "disconnected"}
//!   {"timestamp_ms": 1700000000000, "features": [..], "targets": [..]}
//!
//! Usage:
//!   producer | cargo run --release --bin online_runtime
//!
//! Configuration comes from TL_* environment variables (see PipelineConfig).

use dotenv::dotenv;
use log::{error, info, warn};
use tactile_learn::pipeline::{
    persistence::open_sink, run_session_loop, Ensemble, LogActuationSink, PipelineConfig,
    SessionController, SessionSettings, TransportMessage,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Forward stdin lines, in order, into the inbound channel until EOF
async fn stdin_transport(inbound_tx: mpsc::Sender<TransportMessage>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut malformed = 0u64;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("❌ Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<TransportMessage>(&line) {
            Ok(message) => {
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                malformed += 1;
                warn!("⚠️  Dropping malformed line ({} so far): {}", malformed, e);
            }
        }
    }

    info!("Transport reached end of input");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Online Runtime");

    let config = PipelineConfig::from_env()?;
    info!("📊 Configuration:");
    info!("   ├─ Arity: {} features -> {} targets", config.feature_arity, config.target_arity);
    info!(
        "   ├─ Model: {} ({})",
        config.model.as_str(),
        if config.single_model { "joint" } else { "per-target" }
    );
    info!(
        "   ├─ Training: every {} samples, window <= {}, {} epochs, tau {}",
        config.required_samples, config.max_samples, config.epochs, config.tau
    );
    info!("   ├─ Learning budget: {}s", config.learning_time.as_secs());
    info!("   └─ Storage: {:?} at {} (save: {})", config.storage_backend, config.data_path, config.save_data);

    let ensemble = Ensemble::from_config(&config)?;

    let (inbound_tx, inbound_rx) = mpsc::channel::<TransportMessage>(config.channel_buffer);

    let mut controller = SessionController::new(SessionSettings::from_config(&config), ensemble, inbound_rx)?
        .with_actuation(Box::new(LogActuationSink::new()));

    if config.save_data {
        controller = controller.with_sink(open_sink(&config)?);
    }

    tokio::spawn(stdin_transport(inbound_tx));

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("❌ Failed to listen for CTRL+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    info!("🔄 Press CTRL+C to shutdown gracefully");
    run_session_loop(controller, Duration::from_millis(config.tick_interval_ms), shutdown).await;

    info!("✅ Online runtime stopped");
    Ok(())
}
