//! HTTP + WebSocket control plane.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::server::TunnelManager;
use crate::state::AppState;

/// Attempts per port before the control plane gives up.
const BIND_RETRIES: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct ApiServerConfig {
    pub port: u16,
    pub fallback_port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            fallback_port: 7071,
        }
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, manager: Arc<TunnelManager>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { manager }),
        }
    }

    pub fn build_router(&self) -> Router {
        // /ping and the WS handshake never require a token.
        let public = Router::new()
            .route("/ping", get(handlers::ping))
            .route("/ws/events", get(ws::ws_events))
            .with_state(self.state.clone());

        let protected = Router::new()
            .route("/status", get(handlers::status))
            .route("/tunnels", get(handlers::tunnels))
            .route("/servers", get(handlers::servers))
            .route("/servers/add", post(handlers::add_server))
            .route(
                "/servers/{id}",
                put(handlers::update_server).delete(handlers::delete_server),
            )
            .route("/servers/delete/{id}", post(handlers::delete_server_post))
            .route("/connect/{id}", post(handlers::connect))
            .route("/disconnect/{id}", post(handlers::disconnect))
            .route("/disconnect-all", post(handlers::disconnect_all))
            .route("/scan", post(handlers::start_scan))
            .route("/scan/progress", get(handlers::scan_progress))
            .route("/logs", get(handlers::logs))
            .route("/export", get(handlers::export))
            .route("/import", post(handlers::import))
            .route("/stats/{id}", get(handlers::stats))
            .route("/profiles", get(handlers::profiles))
            .route("/profiles/add", post(handlers::add_profile))
            .route("/profiles/connect/{id}", post(handlers::connect_profile))
            .route("/profiles/{id}", delete(handlers::delete_profile))
            .route("/settings", get(handlers::get_settings).put(handlers::put_settings))
            .route("/token/regenerate", post(handlers::regenerate_token))
            .route("/auth/enable", post(handlers::enable_auth))
            .route("/auth/disable", post(handlers::disable_auth))
            .route("/help", get(handlers::help))
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_auth,
            ));

        public.merge(protected).layer(CorsLayer::permissive())
    }

    /// Bind, preferring the configured port, falling back, retrying both.
    /// Only exhausting the retry budget is fatal for the control plane; the
    /// tunnel engine keeps running headless in that case.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let router = self.build_router();
        let listener = self.bind_with_fallback().await?;
        let port = listener.local_addr()?.port();
        self.state.manager.set_api_port(port);
        info!("control api listening on 0.0.0.0:{port}");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("control api server error")?;
        Ok(())
    }

    async fn bind_with_fallback(&self) -> Result<TcpListener> {
        let candidates = [self.config.port, self.config.fallback_port];
        for attempt in 1..=BIND_RETRIES {
            for port in candidates {
                match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await {
                    Ok(listener) => return Ok(listener),
                    Err(e) => {
                        warn!("failed to bind api port {port} (attempt {attempt}): {e}");
                    }
                }
            }
            if attempt < BIND_RETRIES {
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
        }
        anyhow::bail!(
            "could not bind control api on ports {} or {} after {BIND_RETRIES} attempts",
            self.config.port,
            self.config.fallback_port
        )
    }
}
