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

//! Runs both probes for one metrics scrape and turns their outcomes into a
//! Prometheus exposition.

use std::sync::Arc;

use prometheus::Registry;
use tokio::task::{JoinError, JoinHandle};

use crate::cloudprobe::config::ProbeConfig;
use crate::cloudprobe::logger::{log_error, log_info, log_warn};
use crate::cloudprobe::observability::metrics::{self, ProbeMetrics};
use crate::cloudprobe::openstack::CloudProvider;
use crate::cloudprobe::probe::{
    compute, storage, Deadline, ProbeContext, ProbeFailure, ProbeKind, ProbeOutcome, ProbeResult,
};
use crate::cloudprobe::ssh::RemoteLogin;
use crate::cloudprobe::util::error::{with_context, DynResult};

const COMPONENT: &str = "coordinator";

#[derive(Debug)]
pub struct ScrapeReport {
    pub compute: ProbeOutcome,
    pub storage: ProbeOutcome,
}

pub struct ProbeCoordinator {
    ctx: ProbeContext,
}

impl ProbeCoordinator {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        login: Arc<dyn RemoteLogin>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            ctx: ProbeContext {
                provider,
                login,
                config: Arc::new(config),
            },
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.ctx.config
    }

    /// Runs both probes and renders the per-scrape registry followed by the
    /// process-wide collectors.
    pub async fn scrape(&self) -> DynResult<Vec<u8>> {
        let registry = Registry::new();
        let spawn = ProbeMetrics::register(&registry, ProbeKind::Compute)
            .map_err(|err| with_context(err, "failed to register spawn metrics"))?;
        let object_store = ProbeMetrics::register(&registry, ProbeKind::Storage)
            .map_err(|err| with_context(err, "failed to register object store metrics"))?;
        metrics::register_build_info(&registry)
            .map_err(|err| with_context(err, "failed to register build info"))?;

        self.run(&spawn, &object_store).await;

        let mut buffer = Vec::new();
        metrics::encode(&registry, &mut buffer)?;
        metrics::gather_into(&mut buffer)?;
        Ok(buffer)
    }

    /// Starts both probes under one deadline and waits for both, including
    /// their cleanup, before publishing the outcomes.
    pub async fn run(&self, spawn: &ProbeMetrics, object_store: &ProbeMetrics) -> ScrapeReport {
        let deadline = Deadline::after(self.ctx.config.request_timeout);
        let compute_task = tokio::spawn(compute::execute(
            self.ctx.clone(),
            spawn.timing(),
            deadline.clone(),
        ));
        let storage_task = tokio::spawn(storage::execute(
            self.ctx.clone(),
            object_store.timing(),
            deadline.clone(),
        ));

        let (compute_outcome, storage_outcome) = tokio::join!(
            settle(ProbeKind::Compute, compute_task, &deadline),
            settle(ProbeKind::Storage, storage_task, &deadline),
        );
        spawn.publish(&compute_outcome);
        object_store.publish(&storage_outcome);

        ScrapeReport {
            compute: compute_outcome,
            storage: storage_outcome,
        }
    }
}

/// Resolves the outcome of one probe task. When the deadline fires first the
/// outcome is a request timeout, but the task is still awaited so its cleanup
/// completes before the scrape answers.
async fn settle(
    kind: ProbeKind,
    mut task: JoinHandle<ProbeResult<()>>,
    deadline: &Deadline,
) -> ProbeOutcome {
    tokio::select! {
        biased;
        joined = &mut task => return conclude(kind, joined),
        _ = deadline.expired() => {}
    }

    log_warn(
        COMPONENT,
        "Probe exceeded the request deadline, waiting for cleanup",
        &[("probe", kind.as_label())],
    );
    conclude(kind, task.await);
    let outcome = ProbeOutcome::Failure(ProbeFailure::RequestTimeout);
    log_error(
        COMPONENT,
        "Probe failed",
        &[("probe", kind.as_label()), ("error", &outcome.as_label())],
    );
    outcome
}

fn conclude(kind: ProbeKind, joined: Result<ProbeResult<()>, JoinError>) -> ProbeOutcome {
    let outcome = match joined {
        Ok(result) => ProbeOutcome::from(result),
        Err(err) => {
            log_error(
                COMPONENT,
                "Probe task did not complete",
                &[("probe", kind.as_label()), ("error", &err.to_string())],
            );
            ProbeOutcome::Failure(ProbeFailure::Aborted)
        }
    };
    match &outcome {
        ProbeOutcome::Success => {
            log_info(COMPONENT, "Probe succeeded", &[("probe", kind.as_label())])
        }
        ProbeOutcome::Failure(_) => log_error(
            COMPONENT,
            "Probe failed",
            &[("probe", kind.as_label()), ("error", &outcome.as_label())],
        ),
    }
    outcome
}
