//! HTTP API gateway for Grantwell.
//!
//! Exposes the health check and the v1 API: streamed chat turns,
//! conversation history, per-conversation memory, and the domain-event log.
//!
//! Built on Axum for high performance async HTTP.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use grantwell_agent::TurnController;
use grantwell_config::{AppConfig, GatewayConfig};
use grantwell_core::error::{MemoryError, ProviderError};
use grantwell_core::event::EventBus;
use grantwell_memory::Stores;
use grantwell_tools::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Reasoning engine unavailable: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage unavailable: {0}")]
    Storage(#[from] MemoryError),

    #[error("Invalid capability map: {0}")]
    Registry(#[from] RegistryError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the full router: `/health` plus the v1 API under `/v1`.
///
/// Layers applied:
/// - CORS limited to the local web client
/// - Request body size limit (attachments arrive inline)
/// - HTTP trace logging
pub fn build_router(api_state: api_v1::SharedApiState, config: &GatewayConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(HeaderValue::from_static(
            "http://localhost:5173",
        )))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(api_v1::USER_ID_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(api_state))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// Storage is opened once here and closed on Ctrl-C, after the server has
/// drained and every spawned turn has finished.
pub async fn start(config: AppConfig) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let provider = grantwell_providers::build_from_config(&config)?;
    let stores = Stores::open(&config.storage).await?;
    let controller = TurnController::from_config(
        &config,
        provider,
        stores.memory.clone(),
        stores.history.clone(),
        Arc::new(EventBus::default()),
    )?;

    let api_state = Arc::new(api_v1::ApiV1State {
        controller: Arc::new(controller),
        memory: stores.memory.clone(),
        history: stores.history.clone(),
        turns: TaskTracker::new(),
    });
    let app = build_router(api_state.clone(), &config.gateway);

    info!(addr = %addr, storage = %config.storage.backend, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    api_state.turns.close();
    if !api_state.turns.is_empty() {
        info!(turns = api_state.turns.len(), "Waiting for running turns");
    }
    api_state.turns.wait().await;
    stores.close().await;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use grantwell_agent::TurnSettings;
    use grantwell_core::error::ProviderError;
    use grantwell_core::provider::{EngineRequest, EngineResponse, Provider};
    use grantwell_memory::{InMemoryHistory, InMemoryMemory};
    use grantwell_tools::CapabilityRegistry;
    use tower::ServiceExt;

    struct Unreachable;

    #[async_trait::async_trait]
    impl Provider for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn complete(&self, _request: EngineRequest) -> Result<EngineResponse, ProviderError> {
            Err(ProviderError::Network("offline".into()))
        }
    }

    fn test_state() -> api_v1::SharedApiState {
        let memory: Arc<dyn grantwell_core::MemoryStore> = Arc::new(InMemoryMemory::new());
        let history: Arc<dyn grantwell_core::HistoryStore> = Arc::new(InMemoryHistory::new());
        let registry = Arc::new(CapabilityRegistry::builtin(memory.clone()).unwrap());
        let controller = TurnController::new(
            Arc::new(Unreachable),
            memory.clone(),
            history.clone(),
            registry,
            Arc::new(EventBus::default()),
            TurnSettings::default(),
        );
        Arc::new(api_v1::ApiV1State {
            controller: Arc::new(controller),
            memory,
            history,
            turns: TaskTracker::new(),
        })
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(test_state(), &GatewayConfig::default());

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn body_limit_is_enforced() {
        let config = GatewayConfig {
            max_body_bytes: 64,
            ..GatewayConfig::default()
        };
        let app = build_router(test_state(), &config);

        let big = serde_json::json!({ "message": "x".repeat(1024) }).to_string();
        let req = Request::builder()
            .method("POST")
            .uri("/v1/agents/grant-cards/chat")
            .header("content-type", "application/json")
            .body(Body::from(big))
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn v1_is_nested() {
        let app = build_router(test_state(), &GatewayConfig::default());
        let req = Request::builder()
            .uri("/v1/agents")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
