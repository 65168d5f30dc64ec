use std::sync::Arc;
use tracing::info;

use jpel_engine::config::Config;
use jpel_engine::engine::ProcessEngine;
use jpel_engine::server::{build_router, AppState};
use jpel_engine::store::create_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jpel_engine=info,tower_http=info".into()),
        )
        .init();

    let config = Config::load()?;
    let store = create_store(&config.database).await?;
    let engine = Arc::new(ProcessEngine::new(store.clone()));

    let app = build_router(AppState { engine, store });

    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    info!("Listening on {}", config.server.addr);
    axum::serve(listener, app).await?;

    Ok(())
}
