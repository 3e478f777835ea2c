//! Read-only HTTP view of the readings store

use crate::store::ReadingsStore;
use airsense_shared::Reading;
use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, Method, StatusCode},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

type SharedStore = Arc<ReadingsStore>;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub readings: usize,
    pub devices: usize,
}

/// Filters for `GET /readings`
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub device: Option<String>,
}

pub fn router(store: SharedStore) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health))
        .route("/readings", get(readings))
        .route("/readings/latest", get(latest_all))
        .route("/readings/latest/:device", get(latest_one))
        .layer(cors)
        .with_state(store)
}

/// Serve the API on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, store: SharedStore, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Query API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(store): State<SharedStore>) -> Json<Health> {
    Json(Health {
        readings: store.len().await,
        devices: store.device_count().await,
    })
}

async fn latest_all(State(store): State<SharedStore>) -> Json<BTreeMap<String, Reading>> {
    Json(store.latest_by_device().await)
}

async fn latest_one(
    State(store): State<SharedStore>,
    Path(device): Path<String>,
) -> Result<Json<Reading>, StatusCode> {
    store
        .latest(&device)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn readings(
    State(store): State<SharedStore>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<Reading>> {
    let readings = match query.device {
        Some(device) => store.history_for(&device, query.since, query.until).await,
        None => store.history(query.since, query.until).await,
    };
    Json(readings)
}
