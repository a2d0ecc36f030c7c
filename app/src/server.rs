use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use fleet_core::{
    HistoryRangeReader, LatestSnapshot, LatestStateAggregator, Point, PointSource, QueryConfig,
    stopped,
};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info};

pub const DEFAULT_BIND: &str = "0.0.0.0:5000";

#[derive(Clone)]
pub struct AppState {
    source: Arc<dyn PointSource + Send + Sync>,
    aggregator: LatestStateAggregator,
    history: HistoryRangeReader,
}

impl AppState {
    pub fn new(source: Arc<dyn PointSource + Send + Sync>, query: &QueryConfig) -> Self {
        Self {
            source,
            aggregator: LatestStateAggregator::new(query),
            history: HistoryRangeReader::new(query),
        }
    }
}

/// Any failure on the read path: HTTP 500 with `{"error": message}`.
struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0 })),
        )
            .into_response()
    }
}

async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, fleet_core::RetrievalError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!("query failed: {err}");
            Err(ApiError(err.to_string()))
        }
        Err(err) => {
            error!("query task failed: {err}");
            Err(ApiError(err.to_string()))
        }
    }
}

async fn all_data(State(state): State<AppState>) -> Result<Json<LatestSnapshot>, ApiError> {
    let latest = blocking(move || state.aggregator.snapshot(state.source.as_ref())).await?;
    Ok(Json(latest))
}

async fn history(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<Vec<Point>>, ApiError> {
    let points = blocking(move || state.history.history(state.source.as_ref(), &node_id)).await?;
    Ok(Json(points))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/all_data", get(all_data))
        .route("/api/history/:node_id", get(history))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(bind: &str, state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind read api {bind}"))?;
    info!(
        "read api listening on http://{}",
        listener.local_addr().context("listener address")?
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
        .await
        .context("serve read api")
}
