//! Axum health surface for the pipeline store.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ronin_store::{PgStore, StoreError};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "ronin-web";

#[derive(Clone)]
pub struct AppState {
    pub database_url: Option<String>,
}

impl AppState {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RONIN_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::from_env())).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(database_url) = &state.database_url else {
        return health_error("DATABASE_URL not set");
    };
    match probe(database_url).await {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(err) => health_error(&err.to_string()),
    }
}

async fn probe(database_url: &str) -> Result<(), StoreError> {
    let mut store = PgStore::connect(database_url).await?;
    store.ping().await
}

fn health_error(detail: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"detail": detail})),
    )
        .into_response()
}
