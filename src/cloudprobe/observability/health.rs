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

use serde::Serialize;
use std::sync::{OnceLock, RwLock};
use std::time::{Duration, Instant};

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            let mut cut = ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

#[derive(Clone, Debug)]
struct SweepObservation {
    finished: Instant,
    error: Option<String>,
}

fn last_sweep() -> &'static RwLock<Option<SweepObservation>> {
    static LAST_SWEEP: OnceLock<RwLock<Option<SweepObservation>>> = OnceLock::new();
    LAST_SWEEP.get_or_init(|| RwLock::new(None))
}

/// Records the outcome of a collector sweep. `error` is set when the sweep
/// could not run at all (authentication failure).
pub fn observe_sweep(error: Option<String>) {
    let observation = SweepObservation {
        finished: Instant::now(),
        error,
    };
    if let Ok(mut guard) = last_sweep().write() {
        *guard = Some(observation);
    }
}

/// Returns a readiness assessment used by `/readyz` and `/healthz`.
///
/// The collector counts as healthy until its first sweep has finished, so a
/// freshly started exporter is immediately ready.
pub fn readiness_report() -> HealthReport {
    let observation = last_sweep().read().ok().and_then(|guard| guard.clone());
    let collector = match observation {
        Some(SweepObservation {
            finished,
            error: Some(error),
        }) => ComponentHealth::unhealthy(
            "garbage_collector",
            format!(
                "last sweep {} ago failed: {}",
                format_duration(finished.elapsed()),
                error
            ),
        ),
        _ => ComponentHealth::healthy("garbage_collector"),
    };

    let components = vec![ComponentHealth::healthy("process"), collector];
    let status = if components.iter().all(|component| component.healthy) {
        HealthStatus::Ready
    } else {
        HealthStatus::Degraded
    };

    HealthReport { status, components }
}

/// Liveness probes only check that the process is servicing requests.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth::healthy("process")],
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.1}s", duration.as_secs_f32())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
