//! Read-only HTTP views over the relationship store.

pub mod routes;

use tracing::info;

use crate::db::RelationshipStore;
use crate::error::Result;
use crate::shutdown::SharedShutdown;

pub use routes::{router, ApiState};

/// Serves the API on `0.0.0.0:port` until shutdown is requested.
pub async fn serve(store: RelationshipStore, port: u16, shutdown: SharedShutdown) -> Result<()> {
    let app = router(ApiState { store });
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await?;
    info!("HTTP API stopped");
    Ok(())
}
