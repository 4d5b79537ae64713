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

use std::future::Future;
use std::pin::Pin;

use crate::cloudprobe::logger::{log_info, log_warn};
use crate::cloudprobe::openstack::{CloudResult, ResourceKind};

pub type CompensationFuture = Pin<Box<dyn Future<Output = CloudResult<()>> + Send>>;

struct Compensation {
    kind: ResourceKind,
    id: String,
    action: Box<dyn FnOnce() -> CompensationFuture + Send + Sync>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnwindReport {
    pub completed: Vec<(ResourceKind, String)>,
    pub failed: Vec<(ResourceKind, String)>,
}

/// Undo actions for resources created by a probe run, executed last in
/// first out.
pub struct Compensations {
    component: &'static str,
    entries: Vec<Compensation>,
}

impl Compensations {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            entries: Vec::new(),
        }
    }

    /// Registers the delete for a resource that now exists.
    pub fn push<F, Fut>(&mut self, kind: ResourceKind, id: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CloudResult<()>> + Send + 'static,
    {
        self.entries.push(Compensation {
            kind,
            id: id.into(),
            action: Box::new(move || Box::pin(action()) as CompensationFuture),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every registered action, newest first. A failing action is logged
    /// and does not stop the remaining ones.
    pub async fn unwind(mut self) -> UnwindReport {
        let mut report = UnwindReport::default();
        while let Some(entry) = self.entries.pop() {
            let Compensation { kind, id, action } = entry;
            match action().await {
                Ok(()) => {
                    log_info(
                        self.component,
                        "Deleted probe resource",
                        &[("kind", kind.as_label()), ("id", &id)],
                    );
                    report.completed.push((kind, id));
                }
                Err(err) if err.is_not_found() => {
                    report.completed.push((kind, id));
                }
                Err(err) => {
                    log_warn(
                        self.component,
                        "Failed to delete probe resource",
                        &[
                            ("kind", kind.as_label()),
                            ("id", &id),
                            ("error", &err.to_string()),
                        ],
                    );
                    report.failed.push((kind, id));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprobe::openstack::CloudError;
    use reqwest::StatusCode;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn unwinds_in_reverse_registration_order_past_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut compensations = Compensations::new("test");
        for (kind, id, fail) in [
            (ResourceKind::SecurityGroup, "sg", false),
            (ResourceKind::Keypair, "kp", true),
            (ResourceKind::Server, "srv", false),
        ] {
            let order = order.clone();
            compensations.push(kind, id, move || async move {
                order.lock().unwrap().push(id);
                if fail {
                    Err(CloudError::status("compute", StatusCode::BAD_GATEWAY, "down"))
                } else {
                    Ok(())
                }
            });
        }
        assert_eq!(compensations.len(), 3);

        let report = compensations.unwind().await;
        assert_eq!(*order.lock().unwrap(), vec!["srv", "kp", "sg"]);
        assert_eq!(
            report.completed,
            vec![
                (ResourceKind::Server, "srv".to_string()),
                (ResourceKind::SecurityGroup, "sg".to_string())
            ]
        );
        assert_eq!(report.failed, vec![(ResourceKind::Keypair, "kp".to_string())]);
    }

    #[tokio::test]
    async fn already_deleted_resources_count_as_completed() {
        let mut compensations = Compensations::new("test");
        compensations.push(ResourceKind::FloatingIp, "fip", || async {
            Err(CloudError::status("network", StatusCode::NOT_FOUND, ""))
        });
        let report = compensations.unwind().await;
        assert!(report.failed.is_empty());
        assert_eq!(report.completed.len(), 1);
    }
}
