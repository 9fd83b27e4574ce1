//! updraft - update-check server with binary patch delivery.
//!
//! Tracks the releases of one GitHub repository, classifies their assets by
//! platform, architecture and version, and answers update checks from
//! running clients with either a full download or a binary patch.
//!
//! # Routes
//!
//! - `POST /update`: update check; `200` with [`UpdateResponse`], or `204`
//! - `GET /patches/{file}`: generated patches
//! - `GET /health`: liveness and registry state
//! - `POST /refresh`: rebuild the update graph now (bearer admin token)
//!
//! # Cache layout
//!
//! ```text
//! ~/.updraft/
//! ├── assets/    # Downloaded release assets, decompressed
//! └── patches/   # Generated patches, named by content hash pair
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod service;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use config::{DiffEngineKind, ServerConfig};
pub use error::{AppError, AppResult};
pub use protocol::{UpdateRequest, UpdateResponse};
pub use service::{UpdateDecision, UpdateService};
pub use state::AppState;

/// Run the server until `shutdown` resolves.
///
/// The first registry refresh happens before the listener opens. If it
/// fails the server still starts with an empty graph, answering "no
/// update" until a later refresh succeeds.
pub async fn run_with_shutdown<F>(config: ServerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = config.listen_addr.parse()?;
    let state = Arc::new(AppState::new(config.clone())?);

    if let Err(e) = state.registry().refresh().await {
        warn!(error = %e, "initial refresh failed, starting with an empty update graph");
    }
    let refresher =
        Arc::clone(state.registry()).spawn_refresh_loop(config.refresh_interval_duration());

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, public_url = %config.public_base(), "updraft listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    refresher.abort();
    info!("server stopped");
    Ok(())
}

/// Create the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let patches = ServeDir::new(&state.patches_dir);

    Router::new()
        .route("/update", post(handlers::check_update))
        .route("/health", get(handlers::health))
        .route("/refresh", post(handlers::refresh))
        .nest_service("/patches", patches)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
