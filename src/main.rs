//! muxgate: a multiplexing gateway in front of a single-consumer engine
//!
//! Many TCP clients share one serialized engine:
//! - Each request gets a unique correlation tag before it reaches the engine
//! - One dispatcher drains the engine and routes responses back by tag
//! - Client tags are restored so replies match what the client sent
//! - Messages nobody asked for are logged, broadcast or dropped
//! - Configuration via CLI arguments or TOML file

mod config;
mod dispatcher;
mod engine;
mod framing;
mod protocol;
mod registry;
mod server;
mod session;
mod stats;
mod tag;

use config::Config;
use server::{Gateway, Shutdown};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        engine = ?config.engine.kind,
        framing = ?config.framing,
        tag_field = %config.tag_field,
        request_timeout = ?config.request_timeout,
        max_connections = config.max_connections,
        unsolicited = ?config.unsolicited,
        "Starting muxgate"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async move {
        // Bind before starting the engine so a busy port fails fast
        let listener = server::bind(&config.listen, config.backlog, config.reuse_port)?;
        let engine = engine::open(&config.engine)?;

        let gateway = Gateway::new(config, engine);
        tokio::spawn(watch_signals(gateway.shutdown_handle()));

        gateway.run(listener).await
    })?;

    info!("Shutdown complete");
    Ok(())
}

/// Trigger shutdown on SIGINT or (on unix) SIGTERM.
async fn watch_signals(shutdown: Shutdown) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
                shutdown.trigger();
                return;
            }
        };

        tokio::select! {
            _ = wait_for_ctrl_c() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;

    shutdown.trigger();
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
