//! API router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the API router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Allocation protocol
        .route("/api/v1/allocate", post(handlers::allocate))
        .route("/api/v1/release", post(handlers::release))
        .route("/api/v1/check", post(handlers::check))
        // Introspection
        .route("/api/v1/pools", get(handlers::list_pools))
        .route(
            "/api/v1/pools/:pool/allocations",
            get(handlers::list_allocations),
        )
        // Health check
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, NodeEngine};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn engine() -> Arc<NodeEngine> {
        let (engine, _released) =
            NodeEngine::new("n1", EngineConfig::default(), Arc::new(MemoryStore::new()));
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_not_ready_before_recovery() {
        let app = create_router(Arc::new(AppState::new(engine())));

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(Arc::new(AppState::new(engine())));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_pool_allocations_not_found() {
        let engine = engine();
        engine.recover(&[]).await.unwrap();
        let app = create_router(Arc::new(AppState::new(engine)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/pools/missing/allocations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
