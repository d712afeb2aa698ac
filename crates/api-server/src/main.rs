//! API server binary entry point

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hoopcut_api_server::{start_server, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoopcut=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    if config.inference.api_key.is_empty() {
        tracing::warn!("HOOPCUT_API_KEY is not set; ball detection requests will fail");
    }

    let state = AppState::new(config)?;
    start_server(state).await?;

    Ok(())
}
