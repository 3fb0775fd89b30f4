//! Control API server.
//!
//! Session RPC (start/status/stop/list), the data query surface, and
//! the live event channel for the dashboard.

mod handlers;
mod routes;
mod ws;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::PublicConfig;
use crate::engine::SessionEngine;
use crate::events::EventBus;
use crate::store::Store;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub store: Store,
    pub bus: EventBus,
    pub public_config: PublicConfig,
}

/// Bind and serve until shutdown.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("control API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
