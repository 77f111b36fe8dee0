//! todo-api バイナリのエントリポイント

use anyhow::{anyhow, Context, Result};
use infrastructure::{DynamoDbStore, InMemoryStore, TodoStore};
use shared::{init_tracing, Config, StoreBackend, TokenVerifier};
use std::{net::SocketAddr, sync::Arc};
use todo_api::{app_with_state, AppState};
use todo_service::TodoService;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().map_err(|e| anyhow!(e))?;

    let config = Config::from_env().context("failed to load configuration")?;

    let store: Arc<dyn TodoStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
        StoreBackend::DynamoDb => Arc::new(DynamoDbStore::new(&config).await),
    };
    let state = AppState::new(
        TodoService::new(store),
        TokenVerifier::new(&config.jwt_secret),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        environment = %config.environment,
        backend = %config.store_backend,
        "server starting"
    );

    axum::serve(listener, app_with_state(state))
        .await
        .context("server error")?;
    Ok(())
}
