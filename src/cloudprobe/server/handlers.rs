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

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::AppState;
use crate::cloudprobe::logger::log_error;
use crate::cloudprobe::observability::health;
use crate::cloudprobe::observability::metrics::render_scrape_failure;
use crate::cloudprobe::util::error::render_chain;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Runs both probes and answers with the per-scrape metrics followed by the
/// process-wide ones.
pub(super) async fn metrics(State(state): State<AppState>) -> Response {
    let buffer = match state.coordinator.scrape().await {
        Ok(buffer) => buffer,
        Err(err) => {
            let message = render_chain(err.as_ref());
            log_error("server", "Failed to encode metrics", &[("error", &message)]);
            render_scrape_failure(&message)
        }
    };
    prometheus_response(buffer)
}

fn prometheus_response(buffer: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(buffer));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
    );
    response
}

pub(super) async fn readiness() -> Response {
    let report = health::readiness_report();
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

pub(super) async fn liveness() -> Response {
    let report = health::liveness_report();
    (StatusCode::OK, Json(report)).into_response()
}

pub(super) async fn combined_health() -> Response {
    readiness().await
}
