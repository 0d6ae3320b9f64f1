// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Thin HTTP adapter over the lake core. Every route maps onto one core
//! operation; errors convert to `{"detail": ...}` bodies with the status
//! mapping from the error taxonomy.

mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<(), std::io::Error> {
    let app = routes::api_router(state);
    log::info!("mdlake API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
