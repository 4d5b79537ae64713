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

//! Synthetic end-to-end probes. Each probe walks a fixed sequence of stages,
//! records a timestamp per stage and reports exactly one outcome.

pub mod compensation;
pub mod compute;
pub mod deadline;
pub mod recorder;
pub mod storage;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use compensation::Compensations;
pub use deadline::Deadline;
pub use recorder::{Checkpoint, StepRecorder};

use crate::cloudprobe::config::ProbeConfig;
use crate::cloudprobe::openstack::{CloudError, CloudProvider};
use crate::cloudprobe::ssh::RemoteLogin;
use crate::cloudprobe::util::error::render_chain;

#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },
    #[error("timeout during {0}")]
    TimeoutDuring(&'static str),
    #[error("timeout after {0}")]
    TimeoutAfter(&'static str),
    #[error("request timeout reached")]
    RequestTimeout,
    #[error("probe task aborted")]
    Aborted,
    #[error("{context}: {source}")]
    Cloud {
        context: &'static str,
        #[source]
        source: CloudError,
    },
    #[error("{0}")]
    Provisioning(String),
    #[error("invalid data: {0}")]
    Invalid(String),
}

impl ProbeFailure {
    pub fn cloud(context: &'static str) -> impl FnOnce(CloudError) -> Self {
        move |source| ProbeFailure::Cloud { context, source }
    }

    pub fn not_found(what: &'static str, name: &str) -> Self {
        ProbeFailure::NotFound {
            what,
            name: name.to_string(),
        }
    }
}

pub type ProbeResult<T> = Result<T, ProbeFailure>;

#[derive(Debug)]
pub enum ProbeOutcome {
    Success,
    Failure(ProbeFailure),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }

    /// Value of the `error` label: empty on success, the full cause otherwise.
    pub fn as_label(&self) -> String {
        match self {
            ProbeOutcome::Success => String::new(),
            ProbeOutcome::Failure(failure) => render_chain(failure),
        }
    }
}

impl From<ProbeResult<()>> for ProbeOutcome {
    fn from(result: ProbeResult<()>) -> Self {
        match result {
            Ok(()) => ProbeOutcome::Success,
            Err(failure) => ProbeOutcome::Failure(failure),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    Compute,
    Storage,
}

impl ProbeKind {
    /// Metric namespace suffix.
    pub fn as_label(self) -> &'static str {
        match self {
            ProbeKind::Compute => "spawn",
            ProbeKind::Storage => "object_store",
        }
    }

    pub fn success_help(self) -> &'static str {
        match self {
            ProbeKind::Compute => "1 if a server was spawned, reached and cleaned up",
            ProbeKind::Storage => "1 if an object was uploaded, downloaded and deleted",
        }
    }

    pub fn timing_help(self) -> &'static str {
        match self {
            ProbeKind::Compute => "Unix time at which each server spawn step completed",
            ProbeKind::Storage => "Unix time at which each object store step completed",
        }
    }
}

/// A named stage of a probe state machine.
pub trait Stage: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn as_label(self) -> &'static str;
}

/// Collaborators shared by every probe run of one exporter.
#[derive(Clone)]
pub struct ProbeContext {
    pub provider: Arc<dyn CloudProvider>,
    pub login: Arc<dyn RemoteLogin>,
    pub config: Arc<ProbeConfig>,
}

/// Calls `attempt` every `interval` until it yields a value, fails, or the
/// deadline expires. Expiry is reported as a timeout during `stage`.
pub(crate) async fn poll_until<T, F, Fut>(
    deadline: &Deadline,
    interval: Duration,
    stage: &'static str,
    mut attempt: F,
) -> ProbeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeResult<Option<T>>>,
{
    loop {
        if deadline.is_expired() {
            return Err(ProbeFailure::TimeoutDuring(stage));
        }
        if let Some(value) = attempt().await? {
            return Ok(value);
        }
        if !deadline.pause(interval).await {
            return Err(ProbeFailure::TimeoutDuring(stage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn outcome_labels_carry_the_cause() {
        assert_eq!(ProbeOutcome::Success.as_label(), "");
        let missing = ProbeOutcome::Failure(ProbeFailure::not_found("image", "ubuntu"));
        assert_eq!(missing.as_label(), "image not found: ubuntu");

        let cloud = ProbeFailure::cloud("failed to create container")(CloudError::status(
            "object-store",
            StatusCode::FORBIDDEN,
            "quota",
        ));
        assert_eq!(
            ProbeOutcome::Failure(cloud).as_label(),
            "failed to create container: object-store returned 403 Forbidden: quota"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_when_the_attempt_yields() {
        let deadline = Deadline::after(Duration::from_secs(30));
        let calls = &AtomicUsize::new(0);
        let interval = Duration::from_secs(1);
        let value = poll_until(&deadline, interval, "server_active", move || async move {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            Ok((call == 3).then_some(call))
        })
        .await
        .expect("value");
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reports_the_stage_on_expiry() {
        let deadline = Deadline::after(Duration::from_secs(3));
        let result: ProbeResult<()> =
            poll_until(&deadline, Duration::from_secs(1), "server_active", || async {
                Ok(None)
            })
            .await;
        assert!(matches!(result, Err(ProbeFailure::TimeoutDuring("server_active"))));
    }
}
