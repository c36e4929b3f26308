use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use switchboard_core::{Core, RemoteSessionVerifier, StaticSessionVerifier, SwitchboardPaths};
use switchboard_server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let paths = SwitchboardPaths::from_env();
    let core = Core::init(&paths).await?;
    let bind = core.config.server.bind.clone();

    let state = match RemoteSessionVerifier::from_config(core.http_client().clone(), &core.config.session) {
        Some(sessions) => AppState::new(core, sessions),
        None => {
            warn!("no session auth URL configured; every signed-in call will be rejected");
            AppState::new(core, StaticSessionVerifier::new())
        }
    };

    let listener = TcpListener::bind(&bind).await?;
    info!("Switchboard listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Switchboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", err);
    }
}
