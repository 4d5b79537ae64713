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

//! Tag-based garbage collector. Periodically lists every resource kind the
//! probes create and deletes those whose run name (or platform timestamp)
//! is older than the retention window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::cloudprobe::config::CollectorConfig;
use crate::cloudprobe::logger::{log_debug, log_error, log_info, log_warn};
use crate::cloudprobe::naming::{self, AgePolicy, RunName};
use crate::cloudprobe::observability::metrics::{self, GcDeletionResult, GcSweepResult};
use crate::cloudprobe::observability::{health, tracing};
use crate::cloudprobe::openstack::{
    CloudError, CloudProvider, CloudResult, CloudSession, ResourceKind,
};

const COMPONENT: &str = "gc";

/// Volume states in which a volume is safe to delete.
const DELETABLE_VOLUME_STATES: [&str; 2] = ["available", "error"];

/// How the age of each resource kind is determined.
pub fn age_policy(kind: ResourceKind) -> AgePolicy {
    match kind {
        ResourceKind::Container | ResourceKind::Object => AgePolicy::PlatformTimestamp,
        _ => AgePolicy::NameEmbedded,
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KindTally {
    pub deleted: usize,
    pub failed: usize,
    pub suppressed: usize,
    pub listing_failed: bool,
}

/// Per-kind results of one sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    tallies: BTreeMap<ResourceKind, KindTally>,
}

impl SweepReport {
    pub fn tally(&self, kind: ResourceKind) -> KindTally {
        self.tallies.get(&kind).copied().unwrap_or_default()
    }

    pub fn deleted(&self, kind: ResourceKind) -> usize {
        self.tally(kind).deleted
    }

    pub fn failed(&self, kind: ResourceKind) -> usize {
        self.tally(kind).failed
    }

    pub fn suppressed(&self, kind: ResourceKind) -> usize {
        self.tally(kind).suppressed
    }

    pub fn total_deleted(&self) -> usize {
        self.tallies.values().map(|tally| tally.deleted).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.tallies.values().map(|tally| tally.failed).sum()
    }

    /// True when every listing succeeded and no deletion failed.
    pub fn is_complete(&self) -> bool {
        self.tallies
            .values()
            .all(|tally| tally.failed == 0 && !tally.listing_failed)
    }

    fn entry(&mut self, kind: ResourceKind) -> &mut KindTally {
        self.tallies.entry(kind).or_default()
    }

    fn listing_failed(&mut self, kind: ResourceKind, err: &CloudError) {
        self.entry(kind).listing_failed = true;
        log_warn(
            COMPONENT,
            "Failed to list resources",
            &[("kind", kind.as_label()), ("error", &err.to_string())],
        );
    }

    /// Accounts for one delete call. A resource that is already gone counts
    /// as deleted; an in-use security group is suppressed until a later sweep.
    fn settle(&mut self, kind: ResourceKind, name: &str, result: CloudResult<()>) {
        let tally = self.entry(kind);
        match result {
            Ok(()) => {
                tally.deleted += 1;
                metrics::record_gc_deletion(kind, GcDeletionResult::Deleted);
                log_info(
                    COMPONENT,
                    "Deleted expired resource",
                    &[("kind", kind.as_label()), ("name", name)],
                );
            }
            Err(err) if err.is_not_found() => {
                tally.deleted += 1;
                metrics::record_gc_deletion(kind, GcDeletionResult::Deleted);
                log_debug(
                    COMPONENT,
                    "Expired resource already gone",
                    &[("kind", kind.as_label()), ("name", name)],
                );
            }
            Err(err) if kind == ResourceKind::SecurityGroup && err.is_in_use() => {
                tally.suppressed += 1;
                metrics::record_gc_deletion(kind, GcDeletionResult::InUse);
                log_debug(
                    COMPONENT,
                    "Security group still in use",
                    &[("name", name), ("error", &err.to_string())],
                );
            }
            Err(err) => {
                tally.failed += 1;
                metrics::record_gc_deletion(kind, GcDeletionResult::Failed);
                log_warn(
                    COMPONENT,
                    "Failed to delete expired resource",
                    &[
                        ("kind", kind.as_label()),
                        ("name", name),
                        ("error", &err.to_string()),
                    ],
                );
            }
        }
    }

    fn summary(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        for (kind, tally) in &self.tallies {
            if tally.deleted > 0 || tally.failed > 0 || tally.suppressed > 0 {
                fields.push((
                    kind.as_label(),
                    format!("{}/{}/{}", tally.deleted, tally.failed, tally.suppressed),
                ));
            }
        }
        fields
    }
}

pub struct GarbageCollector {
    provider: Arc<dyn CloudProvider>,
    config: Arc<CollectorConfig>,
}

impl GarbageCollector {
    pub fn new(provider: Arc<dyn CloudProvider>, config: Arc<CollectorConfig>) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Sweeps immediately and then every `interval` until `shutdown` fires.
    /// A sweep that runs longer than the interval is followed directly by the
    /// next one.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = humantime::format_duration(self.config.interval).to_string();
        let retention = humantime::format_duration(self.config.retention).to_string();
        log_info(
            COMPONENT,
            "Garbage collector started",
            &[
                ("prefix", self.config.tag_prefix.as_str()),
                ("interval", interval.as_str()),
                ("retention", retention.as_str()),
            ],
        );

        loop {
            let started = Instant::now();
            let result = tracing::with_span(COMPONENT, "sweep", self.sweep(Utc::now())).await;
            let elapsed = started.elapsed();
            observe(&result, elapsed);

            let pause = self.config.interval.saturating_sub(elapsed);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(pause) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        log_info(COMPONENT, "Garbage collector stopped", &[]);
    }

    /// One pass over every resource kind. Only authentication failures abort
    /// the sweep; everything else is isolated per resource and per kind.
    pub async fn sweep(&self, now: DateTime<Utc>) -> CloudResult<SweepReport> {
        let session = self.provider.authenticate().await?;
        Ok(self.sweep_session(session.as_ref(), now).await)
    }

    pub async fn sweep_session(
        &self,
        session: &dyn CloudSession,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_servers(session, now, &mut report).await;
        self.sweep_security_groups(session, now, &mut report).await;
        self.sweep_keypairs(session, now, &mut report).await;
        self.sweep_floating_ips(session, now, &mut report).await;
        self.sweep_volumes(session, now, &mut report).await;
        self.sweep_containers(session, now, &mut report).await;
        report
    }

    fn expired_name(&self, name: &str, now: DateTime<Utc>) -> bool {
        naming::is_owned_and_expired(name, &self.config.tag_prefix, self.config.retention, now)
    }

    async fn sweep_servers(
        &self,
        session: &dyn CloudSession,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let kind = ResourceKind::Server;
        let servers = match session.list_servers().await {
            Ok(servers) => servers,
            Err(err) => return report.listing_failed(kind, &err),
        };
        for server in servers.iter().filter(|s| self.expired_name(&s.name, now)) {
            let result = session.delete_server(&server.id).await;
            report.settle(kind, &server.name, result);
        }
    }

    async fn sweep_security_groups(
        &self,
        session: &dyn CloudSession,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let kind = ResourceKind::SecurityGroup;
        let groups = match session.list_security_groups().await {
            Ok(groups) => groups,
            Err(err) => return report.listing_failed(kind, &err),
        };
        for group in groups.iter().filter(|g| self.expired_name(&g.name, now)) {
            let result = session.delete_security_group(&group.id).await;
            report.settle(kind, &group.name, result);
        }
    }

    async fn sweep_keypairs(
        &self,
        session: &dyn CloudSession,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let kind = ResourceKind::Keypair;
        let keypairs = match session.list_keypairs().await {
            Ok(keypairs) => keypairs,
            Err(err) => return report.listing_failed(kind, &err),
        };
        for keypair in keypairs.iter().filter(|k| self.expired_name(&k.name, now)) {
            let result = session.delete_keypair(&keypair.name).await;
            report.settle(kind, &keypair.name, result);
        }
    }

    /// Floating addresses carry the run name in their description.
    async fn sweep_floating_ips(
        &self,
        session: &dyn CloudSession,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let kind = ResourceKind::FloatingIp;
        let addresses = match session.list_floating_ips().await {
            Ok(addresses) => addresses,
            Err(err) => return report.listing_failed(kind, &err),
        };
        for address in addresses
            .iter()
            .filter(|a| self.expired_name(&a.description, now))
        {
            let result = session.delete_floating_ip(&address.id).await;
            report.settle(kind, &address.description, result);
        }
    }

    async fn sweep_volumes(
        &self,
        session: &dyn CloudSession,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let kind = ResourceKind::Volume;
        let volumes = match session.list_volumes().await {
            Ok(volumes) => volumes,
            Err(err) => return report.listing_failed(kind, &err),
        };
        for volume in volumes.iter().filter(|v| self.expired_name(&v.name, now)) {
            if !DELETABLE_VOLUME_STATES.contains(&volume.status.as_str()) {
                log_debug(
                    COMPONENT,
                    "Skipping volume in transitional state",
                    &[("name", volume.name.as_str()), ("status", volume.status.as_str())],
                );
                continue;
            }
            let result = session.delete_volume(&volume.id).await;
            report.settle(kind, &volume.name, result);
        }
    }

    async fn sweep_containers(
        &self,
        session: &dyn CloudSession,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let containers = match session.list_containers(&self.config.tag_prefix).await {
            Ok(containers) => containers,
            Err(err) => return report.listing_failed(ResourceKind::Container, &err),
        };
        for container in containers
            .iter()
            .filter(|c| naming::is_owned(&c.name, &self.config.tag_prefix))
        {
            self.sweep_container(session, &container.name, now, report).await;
        }
    }

    /// Deletes expired objects, then re-reads the container and deletes it
    /// only when it is itself expired and reports zero objects.
    async fn sweep_container(
        &self,
        session: &dyn CloudSession,
        container: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let objects = match session.list_objects(container).await {
            Ok(objects) => objects,
            Err(err) => return report.listing_failed(ResourceKind::Object, &err),
        };
        for object in &objects {
            if self.is_stale(ResourceKind::Object, &object.name, object.last_modified_at(), now) {
                let result = session.delete_object(container, &object.name).await;
                report.settle(ResourceKind::Object, &object.name, result);
            }
        }

        let detail = match session.container_detail(container).await {
            Ok(detail) => detail,
            Err(err) => return report.listing_failed(ResourceKind::Container, &err),
        };
        if !self.is_stale(ResourceKind::Container, container, detail.last_modified, now) {
            return;
        }
        match detail.object_count {
            Some(0) => {
                let result = session.delete_container(container).await;
                report.settle(ResourceKind::Container, container, result);
            }
            Some(count) => {
                let count = count.to_string();
                log_debug(
                    COMPONENT,
                    "Keeping expired container that still holds objects",
                    &[("name", container), ("objects", count.as_str())],
                );
            }
            None => log_warn(
                COMPONENT,
                "Keeping container with unreadable object count",
                &[("name", container)],
            ),
        }
    }

    /// Age check by the kind's policy. Platform timestamps fall back to the
    /// run name when the service does not report one.
    fn is_stale(
        &self,
        kind: ResourceKind,
        name: &str,
        timestamp: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match age_policy(kind) {
            AgePolicy::NameEmbedded => self.expired_name(name, now),
            AgePolicy::PlatformTimestamp => {
                let timestamp = timestamp.or_else(|| {
                    RunName::parse(name, &self.config.tag_prefix).and_then(|run| run.created_at())
                });
                naming::is_timestamp_expired(timestamp, self.config.retention, now)
            }
        }
    }
}

fn observe(result: &CloudResult<SweepReport>, elapsed: Duration) {
    let finished_at = Utc::now().timestamp_millis() as f64 / 1000.0;
    let elapsed_label =
        humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)).to_string();
    match result {
        Ok(report) => {
            let outcome = if report.is_complete() {
                GcSweepResult::Completed
            } else {
                GcSweepResult::Partial
            };
            metrics::record_gc_sweep(outcome, elapsed, finished_at);
            health::observe_sweep(None);

            let deleted = report.total_deleted().to_string();
            let failed = report.total_failed().to_string();
            let summary = report.summary();
            let mut fields: Vec<(&str, &str)> = vec![
                ("elapsed", elapsed_label.as_str()),
                ("deleted", deleted.as_str()),
                ("failed", failed.as_str()),
            ];
            fields.extend(summary.iter().map(|(kind, counts)| (*kind, counts.as_str())));
            log_info(COMPONENT, "Sweep finished", &fields);
        }
        Err(err) => {
            metrics::record_gc_sweep(GcSweepResult::AuthFailed, elapsed, finished_at);
            health::observe_sweep(Some(err.to_string()));
            log_error(
                COMPONENT,
                "Sweep aborted, authentication failed",
                &[("error", &err.to_string())],
            );
        }
    }
}
