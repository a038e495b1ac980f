use tnet_control::api;
use tnet_control::config::ControlConfig;
use tnet_control::state::AppState;
use tnet_control::status_poller::StatusPoller;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;
    let addr = config.listen;
    let poll_interval = config.status_poll_interval;
    if config.admin_token.is_none() {
        tracing::warn!("TNET_ADMIN_TOKEN not set; mutating routes are unauthenticated");
    }

    let state = AppState::init(config).await?;
    let controller = state.controller.clone();

    StatusPoller::new(controller.clone(), poll_interval).spawn();

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tnet-control HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, stopping managed instances");
    controller.shutdown().await;
    Ok(())
}
