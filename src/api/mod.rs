//! HTTP surface for the Runlet engine.
//!
//! Exposes the invocation endpoint, the internal scheduler trigger, cache
//! introspection and eviction, metrics, and liveness probes. Per-function
//! API key auth happens inside the dispatcher; the operator endpoints
//! optionally sit behind a shared bearer token (an external admin tier owns
//! real operator auth).

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// The API server.
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a server over an already-wired dispatcher.
    pub fn new(dispatcher: Arc<Dispatcher>, config: Config) -> Self {
        Self {
            state: AppState::new(dispatcher, config),
        }
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        routes::api_routes(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Run the server until `shutdown` resolves.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = self.state.config.bind_address;
        let router = self.router();

        info!("Runlet listening on {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(Error::Io)
    }
}
