use anyhow::Result;
use interceptor::app::AppState;
use interceptor::config::Config;
use interceptor::error::ErrorSink;
use interceptor::server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("interceptor=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    info!(
        rpc = %config.rpc_url,
        chain_id = config.chain_id,
        simulation_mode = config.simulation_mode,
        "Starting Interceptor"
    );

    let (errors, mut unexpected) = ErrorSink::new();
    let state = AppState::from_config(config, errors)?;

    tokio::spawn(async move {
        while let Some(e) = unexpected.recv().await {
            error!(source = e.source, message = %e.message, "Unexpected error reported");
        }
    });
    let _background = state.spawn_background();

    server::serve(state).await
}
