use splunk_mcp::{
    build_app,
    config::{Config, Transport},
    logging,
    mcp::stdio::serve_stdio,
    AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let state = AppState::from_config(&config)?;

    info!(
        splunk = %config.splunk.base_url(),
        tracing_enabled = state.tracing_enabled(),
        timeout_secs = config.upstream_timeout.as_secs(),
        "upstreams configured"
    );

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });

    match config.transport {
        Transport::Stdio => serve_stdio(state).await?,
        Transport::Http => {
            let bind_socket = config.bind_socket()?;
            let shutdown = state.shutdown.clone();
            let app = build_app(state);
            let listener = tokio::net::TcpListener::bind(bind_socket).await?;

            info!(
                bind_addr = %config.bind_addr,
                bind_port = config.bind_port,
                "server starting"
            );

            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
        }
    }

    info!("server stopped");
    Ok(())
}
