use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{conf::ApiConf, metrics::registry};

#[derive(Clone)]
pub struct HealthState {
    pub k8s_caches_synced: Arc<AtomicBool>,
    pub ready_to_process: Arc<AtomicBool>,
    pub startup_complete: Arc<AtomicBool>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            k8s_caches_synced: Arc::new(AtomicBool::new(false)),
            ready_to_process: Arc::new(AtomicBool::new(false)),
            startup_complete: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub async fn liveness_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let startup_complete = state.startup_complete.load(Ordering::Relaxed);
    let status_code = if startup_complete {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = Json(json!({
        "status": if startup_complete { "ok" } else { "unavailable" },
        "checks": {
            "startup_complete": startup_complete
        }
    }));

    (status_code, body)
}

pub async fn readiness_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let k8s_caches_synced = state.k8s_caches_synced.load(Ordering::Relaxed);
    let ready_to_process = state.ready_to_process.load(Ordering::Relaxed);

    let is_ready = k8s_caches_synced && ready_to_process;

    let status_code = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = Json(json!({
        "status": if is_ready { "ok" } else { "unavailable" },
        "checks": {
            "k8s_caches_synced": k8s_caches_synced,
            "ready_to_process": ready_to_process
        }
    }));

    (status_code, body)
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry::REGISTRY.gather();
    match encoder.encode_to_string(&metric_families) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!(
                event.name = "metrics.encode_failed",
                error.message = %e,
                "failed to encode metrics"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

pub fn create_health_router(state: HealthState) -> Router {
    Router::new()
        .route("/livez", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_api_server(state: HealthState, config: &ApiConf) -> Result<(), HealthError> {
    registry::init_registry();

    let app = create_health_router(state);

    let bind_address = format!("{}:{}", config.listen_address, config.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .map_err(|e| HealthError::bind_address(&bind_address, e))?;

    info!(
        event.name = "health.server_started",
        address = %bind_address,
        "health api server listening"
    );

    axum::serve(listener, app)
        .await
        .map_err(HealthError::Serve)?;

    Ok(())
}

/// Errors from the health API server
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("failed to bind health api server to {address}: {source}")]
    BindAddress {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("health api server failed: {0}")]
    Serve(#[source] std::io::Error),
}

impl HealthError {
    pub fn bind_address(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::BindAddress {
            address: address.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_requires_synced_caches_and_processing() {
        let state = HealthState::default();

        let response = readiness_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.k8s_caches_synced.store(true, Ordering::Relaxed);
        let response = readiness_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.ready_to_process.store(true, Ordering::Relaxed);
        let response = readiness_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn liveness_tracks_startup_completion() {
        let state = HealthState::default();

        let response = liveness_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.startup_complete.store(true, Ordering::Relaxed);
        let response = liveness_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_encodes_the_registry() {
        registry::init_registry();
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
