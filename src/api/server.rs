//! Router assembly and the HTTP transport's own lifecycle: bind, serve,
//! graceful shutdown (§4.9). Grounded on the teacher's `RestApiServer`,
//! pared down to the three routes this service exposes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::post;
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::service::Service;

use super::{handlers, middleware as auth};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    pub read_tokens: Arc<HashSet<String>>,
    pub write_tokens: Arc<HashSet<String>>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

pub struct HttpServer {
    state: AppState,
    max_update_size_bytes: usize,
    http_write_timeout: Duration,
    shutdown_timeout: Duration,
}

impl HttpServer {
    pub fn new(state: AppState, max_update_size_bytes: usize, http_write_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self { state, max_update_size_bytes, http_write_timeout, shutdown_timeout }
    }

    fn build_router(&self) -> Router {
        let add_routes = Router::new()
            .route("/add", post(handlers::add))
            .route_layer(middleware::from_fn_with_state(self.state.clone(), auth::require_write_token));

        let read_routes = Router::new()
            .route("/check", post(handlers::check))
            .route("/update", post(handlers::update))
            .route_layer(middleware::from_fn_with_state(self.state.clone(), auth::require_known_token));

        Router::new()
            .merge(add_routes)
            .merge(read_routes)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(self.http_write_timeout))
            .layer(RequestBodyLimitLayer::new(self.max_update_size_bytes))
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::POST])
                    .allow_headers(Any)
                    .allow_origin(Any),
            )
    }

    /// Binds and serves until `SIGINT`/`SIGTERM`, then drains in-flight
    /// requests for at most `shutdown_timeout` before returning regardless
    /// — mirroring the bounded `httpServer.Shutdown()` call this replaces.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let router = self.build_router().into_make_service_with_connect_info::<SocketAddr>();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(%addr, "update server listening");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let serve_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        wait_for_signal().await;
        tracing::info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(());

        match tokio::time::timeout(self.shutdown_timeout, serve_handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::Internal(format!("server error: {e}"))),
            Ok(Err(e)) => Err(Error::Internal(format!("server task panicked: {e}"))),
            Err(_) => {
                tracing::warn!(timeout_secs = self.shutdown_timeout.as_secs(), "graceful shutdown deadline exceeded");
                Ok(())
            }
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
