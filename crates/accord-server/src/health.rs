//! Health endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use accord_connectors::ConnectorRegistry;

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<ConnectorRegistry>,
    pub check_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Health of every live connector instance, keyed by connector id
    pub connectors: BTreeMap<String, bool>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let connectors: BTreeMap<String, bool> = state
        .registry
        .health_check(state.check_timeout)
        .await
        .into_iter()
        .map(|(id, healthy)| (id.to_string(), healthy))
        .collect();

    let status = if connectors.values().all(|healthy| *healthy) {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        connectors,
    })
}
