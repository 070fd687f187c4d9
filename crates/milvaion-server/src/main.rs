//! Binary entry point: load configuration, start the control plane, and
//! wait for a shutdown signal. Grounded in the source's `main.rs`
//! (arcana-server), dropped down to the single monolithic deployment mode
//! this spec describes (§1 Non-goals rule out a layered/distributed
//! deployment topology).

use milvaion_config::ConfigLoader;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();

    info!(version = env!("CARGO_PKG_VERSION"), "starting milvaion server");

    if let Err(e) = run().await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> milvaion_core::MilvaionResult<()> {
    let config = ConfigLoader::load_default()?;
    info!(environment = %config.app.environment, "configuration loaded");

    let server = milvaion_server::Server::start(config).await?;

    shutdown_signal().await;
    info!("shutdown signal received, draining components");
    server.shutdown().await;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,milvaion=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received ctrl+c, initiating graceful shutdown");
        }
        () = terminate => {
            info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
