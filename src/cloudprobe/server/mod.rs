/*
 * Copyright (C) 2024 The Cloudprobe Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! HTTP surface of the exporter: `/metrics` runs both probes per scrape,
//! the health endpoints report process and collector state.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cloudprobe::coordinator::ProbeCoordinator;
use crate::cloudprobe::logger::log_info;
use crate::cloudprobe::util::error::{with_context, DynResult};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ProbeCoordinator>,
}

pub fn build_router(coordinator: Arc<ProbeCoordinator>) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/healthz", get(handlers::combined_health))
        .route("/readyz", get(handlers::readiness))
        .route("/livez", get(handlers::liveness))
        .with_state(AppState { coordinator })
}

/// Serves until `shutdown` fires. In-flight scrapes finish before this
/// returns.
pub async fn serve(
    addr: SocketAddr,
    coordinator: Arc<ProbeCoordinator>,
    shutdown: CancellationToken,
) -> DynResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind exporter listener at {addr}")))?;

    let listen_addr_text = addr.to_string();
    log_info(
        "server",
        "HTTP server listening",
        &[("addr", listen_addr_text.as_str())],
    );

    axum::serve(listener, build_router(coordinator))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| with_context(e, "HTTP server terminated"))?;

    log_info("server", "HTTP server stopped", &[]);
    Ok(())
}
