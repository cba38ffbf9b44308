//! Node-local HTTP exposure of the allocation protocol
//!
//! # Endpoints
//!
//! ## Allocation protocol
//! - `POST /api/v1/allocate` - Allocate an address (idempotent per container interface)
//! - `POST /api/v1/release` - Release an address (idempotent)
//! - `POST /api/v1/check` - Compare a reported address with the recorded one
//!
//! ## Introspection
//! - `GET /api/v1/pools` - Pools on this node with range lifecycles
//! - `GET /api/v1/pools/:pool/allocations` - Live allocations of a pool
//!
//! ## Health
//! - `GET /health` - Fails once persistence is fatally broken
//! - `GET /ready` - Succeeds once startup recovery completed

pub mod dto;
pub mod handlers;
pub mod router;
pub mod state;

pub use dto::*;
pub use router::create_router;
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Serve the API until the shutdown signal flips to `true`
pub async fn start_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Starting API server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
