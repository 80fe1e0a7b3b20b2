//! Cadence voice agent binary.
//!
//! Connects to the conversation backend, then joins audio rooms on request
//! until SIGTERM/SIGINT.

use cadence_server::backend::DEFAULT_INBOUND_CAPACITY;
use cadence_server::backoff::Strategy;
use cadence_server::config::Invocation;
use cadence_server::manager::DEFAULT_EVENT_CAPACITY;
use cadence_server::{config, BackendClient, Config, ManagerError, SessionManager};
use cadence_voice::{LiveKitConnector, SessionDeps, SttService, TtsService, VoiceService};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let invocation = match config::parse_invocation(std::env::args().skip(1), |key| {
        std::env::var(key).ok()
    }) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{e}\n\n{}", config::USAGE);
            std::process::exit(2);
        }
    };
    let (resolved_config_path, config_source) = match invocation {
        Invocation::Help => {
            println!("{}", config::USAGE);
            return;
        }
        Invocation::Run { path, source } => (path, source),
    };
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration: the agent cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );
    config.log_summary();

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "voice agent failed");
        std::process::exit(1);
    }

    tracing::info!("voice agent shut down");
}

async fn run(config: Config) -> Result<(), ManagerError> {
    let transcriber = Arc::new(SttService::new(config.asr.clone(), &config.audio)?);
    let synthesizer = Arc::new(TtsService::new(config.tts.clone())?);
    let connector = Arc::new(LiveKitConnector::new(
        VoiceService::new(config.livekit.clone()),
        config.audio.clone(),
        config.tts.sample_rate,
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_INBOUND_CAPACITY);
    let backend = BackendClient::new(&config.backend, inbound_tx);

    let startup = CancellationToken::new();
    tokio::select! {
        connected = backend.establish(Strategy::Standard, &startup) => {
            connected.map_err(|e| ManagerError::Startup(format!("backend unreachable: {e}")))?;
        }
        () = shutdown_signal() => {
            startup.cancel();
            return Ok(());
        }
    }

    let (events_tx, events_rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
    let deps = SessionDeps {
        connector,
        transcriber,
        synthesizer,
        events: events_tx,
        queue_capacity: config.session.queue_capacity,
        capture: config.audio.clone(),
    };

    let manager = SessionManager::new(backend, deps);
    manager.spawn(inbound_rx, events_rx, &config.session);
    tracing::info!(backend = %config.backend.url, "voice agent ready");

    shutdown_signal().await;
    manager.shutdown().await;
    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
