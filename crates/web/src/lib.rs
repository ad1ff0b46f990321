//! ldap-configmap HTTP surface.
//!
//! Provides an Axum-based HTTP server with:
//! - A small landing page
//! - `/metrics` in the Prometheus/OpenMetrics text format
//! - `/healthz` and `/api/status` for probes and operators

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use ldap_configmap_core::sync_engine::SyncEngine;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub sync_engine: Arc<SyncEngine>,
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Self {
        Self {
            state: Arc::new(AppState { sync_engine }),
        }
    }

    /// All routes with middleware applied.
    pub fn router(&self) -> Router {
        Router::new()
            .merge(api::status::routes())
            .merge(api::metrics::routes())
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve on an already bound listener until the task is dropped.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        info!(addr = %listener.local_addr()?, "starting web server");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Bind the listener up front so an unusable address fails startup.
pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = listen_addr.parse()?;
    Ok(TcpListener::bind(addr).await?)
}
