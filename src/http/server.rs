//! HTTP server implementation.

use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admission_middleware, AdmissionState};
use crate::error::Result;
use crate::ratelimit::AdmissionBackend;

/// HTTP server that puts every route behind the admission middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Application routes, already wrapped by the middleware
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server admitting requests through `backend`.
    pub fn new(
        addr: SocketAddr,
        backend: Arc<dyn AdmissionBackend>,
        token_header: &str,
    ) -> Result<Self> {
        let router = router(AdmissionState::new(backend, token_header)?);
        Ok(Self { addr, router })
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server with admission control");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

/// Build the application router behind the admission middleware.
pub fn router(state: AdmissionState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .layer(middleware::from_fn_with_state(state, admission_middleware))
}

async fn ping() -> &'static str {
    "pong"
}
