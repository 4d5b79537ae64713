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

//! Server spawn probe: boots a server from a fresh volume behind a floating
//! address and proves it accepts SSH with a key generated for the run.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use prometheus::GaugeVec;

use super::{
    poll_until, Compensations, Deadline, ProbeContext, ProbeFailure, ProbeResult, Stage,
    StepRecorder,
};
use crate::cloudprobe::config::ProbeConfig;
use crate::cloudprobe::logger::{log_debug, log_info, log_warn};
use crate::cloudprobe::naming::new_run_name;
use crate::cloudprobe::observability::tracing;
use crate::cloudprobe::openstack::types::{
    FloatingIp, Network, SecurityRuleRequest, Server, ServerRequest, Volume, VolumeRequest,
};
use crate::cloudprobe::openstack::{CloudResult, CloudSession, ResourceKind};
use crate::cloudprobe::ssh::keys::host_key_block;
use crate::cloudprobe::ssh::{ClientKey, HostKey, LoginTarget, RemoteLogin};

const COMPONENT: &str = "compute";
const SECURITY_GROUP_DESCRIPTION: &str = "cloudprobe remote login probe";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeStage {
    Start,
    Authenticated,
    ImageResolved,
    FlavorResolved,
    NetworkResolved,
    SecurityGroupCreated,
    SecurityRuleCreated,
    KeypairUploaded,
    ExternalNetworkResolved,
    FloatingAddressAllocated,
    ServerCreateRequested,
    ServerActive,
    FloatingAddressAssociated,
    ConsoleOutputObserved,
    HostKeysRetrieved,
    RemoteLoginVerified,
    End,
}

impl ComputeStage {
    pub const ALL: [ComputeStage; 17] = [
        ComputeStage::Start,
        ComputeStage::Authenticated,
        ComputeStage::ImageResolved,
        ComputeStage::FlavorResolved,
        ComputeStage::NetworkResolved,
        ComputeStage::SecurityGroupCreated,
        ComputeStage::SecurityRuleCreated,
        ComputeStage::KeypairUploaded,
        ComputeStage::ExternalNetworkResolved,
        ComputeStage::FloatingAddressAllocated,
        ComputeStage::ServerCreateRequested,
        ComputeStage::ServerActive,
        ComputeStage::FloatingAddressAssociated,
        ComputeStage::ConsoleOutputObserved,
        ComputeStage::HostKeysRetrieved,
        ComputeStage::RemoteLoginVerified,
        ComputeStage::End,
    ];
}

impl Stage for ComputeStage {
    fn as_label(self) -> &'static str {
        match self {
            ComputeStage::Start => "start",
            ComputeStage::Authenticated => "authenticated",
            ComputeStage::ImageResolved => "image_resolved",
            ComputeStage::FlavorResolved => "flavor_resolved",
            ComputeStage::NetworkResolved => "network_resolved",
            ComputeStage::SecurityGroupCreated => "security_group_created",
            ComputeStage::SecurityRuleCreated => "security_rule_created",
            ComputeStage::KeypairUploaded => "keypair_uploaded",
            ComputeStage::ExternalNetworkResolved => "external_network_resolved",
            ComputeStage::FloatingAddressAllocated => "floating_address_allocated",
            ComputeStage::ServerCreateRequested => "server_create_requested",
            ComputeStage::ServerActive => "server_active",
            ComputeStage::FloatingAddressAssociated => "floating_address_associated",
            ComputeStage::ConsoleOutputObserved => "console_output_observed",
            ComputeStage::HostKeysRetrieved => "host_keys_retrieved",
            ComputeStage::RemoteLoginVerified => "remote_login_verified",
            ComputeStage::End => "end",
        }
    }
}

/// Entry point used by the coordinator.
pub async fn execute(ctx: ProbeContext, timing: GaugeVec, deadline: Deadline) -> ProbeResult<()> {
    let mut recorder = StepRecorder::new(COMPONENT, timing, deadline);
    run(&ctx, &mut recorder).await
}

/// Runs one spawn probe. Every resource created is deleted again before this
/// returns, whatever the outcome.
pub async fn run(ctx: &ProbeContext, recorder: &mut StepRecorder<ComputeStage>) -> ProbeResult<()> {
    recorder.record(ComputeStage::Start)?;
    let name = new_run_name(&ctx.config.tag_prefix);

    tracing::with_run_span("probe.compute", name.clone(), spawn_probe(ctx, recorder, &name)).await
}

async fn spawn_probe(
    ctx: &ProbeContext,
    recorder: &mut StepRecorder<ComputeStage>,
    name: &str,
) -> ProbeResult<()> {
    log_info(COMPONENT, "Starting server spawn probe", &[]);
    let session = ctx
        .provider
        .authenticate()
        .await
        .map_err(ProbeFailure::cloud("authentication failure"))?;
    recorder.record(ComputeStage::Authenticated)?;

    let mut spawn = Spawn {
        config: &ctx.config,
        login: ctx.login.as_ref(),
        session,
        name,
        recorder,
        compensations: Compensations::new(COMPONENT),
    };
    let result = spawn.provision().await;

    let compensations = spawn.compensations;
    if !compensations.is_empty() {
        let report = compensations.unwind().await;
        log_info(
            COMPONENT,
            "Probe resources released",
            &[
                ("deleted", &report.completed.len().to_string()),
                ("failed", &report.failed.len().to_string()),
            ],
        );
    }
    result
}

struct Spawn<'a> {
    config: &'a ProbeConfig,
    login: &'a dyn RemoteLogin,
    session: Arc<dyn CloudSession>,
    name: &'a str,
    recorder: &'a mut StepRecorder<ComputeStage>,
    compensations: Compensations,
}

impl Spawn<'_> {
    async fn provision(&mut self) -> ProbeResult<()> {
        let images = self
            .session
            .list_images(&self.config.image)
            .await
            .map_err(ProbeFailure::cloud("failed to list images"))?;
        let image = find_named(images, &self.config.image, "image", |image| &image.name)?;
        self.recorder.record(ComputeStage::ImageResolved)?;

        let flavors = self
            .session
            .list_flavors()
            .await
            .map_err(ProbeFailure::cloud("failed to list flavors"))?;
        let flavor = find_named(flavors, &self.config.flavor, "flavor", |flavor| &flavor.name)?;
        self.recorder.record(ComputeStage::FlavorResolved)?;

        let network = self
            .resolve_network(&self.config.private_network, "network")
            .await?;
        self.recorder.record(ComputeStage::NetworkResolved)?;

        let group = self
            .session
            .create_security_group(self.name, SECURITY_GROUP_DESCRIPTION)
            .await
            .map_err(ProbeFailure::cloud("failed to create security group"))?;
        self.register(ResourceKind::SecurityGroup, &group.id, |session, id| async move {
            tolerate_in_use(
                session.delete_security_group(&id).await,
                ResourceKind::SecurityGroup,
                &id,
            )
        });
        self.recorder.record(ComputeStage::SecurityGroupCreated)?;

        let rule = self
            .session
            .create_security_rule(&SecurityRuleRequest::tcp_ingress(
                &group.id,
                self.config.login_port,
            ))
            .await
            .map_err(ProbeFailure::cloud("failed to create security group rule"))?;
        self.register(ResourceKind::SecurityRule, &rule.id, |session, id| async move {
            session.delete_security_rule(&id).await
        });
        self.recorder.record(ComputeStage::SecurityRuleCreated)?;

        let key = ClientKey::generate(self.name)
            .map_err(|err| ProbeFailure::Provisioning(format!("cannot generate key pair: {err}")))?;
        let keypair = self
            .session
            .create_keypair(self.name, key.authorized_key())
            .await
            .map_err(ProbeFailure::cloud("failed to upload key pair"))?;
        self.register(ResourceKind::Keypair, &keypair.name, |session, name| async move {
            session.delete_keypair(&name).await
        });
        self.recorder.record(ComputeStage::KeypairUploaded)?;

        let external = self
            .resolve_network(&self.config.external_network, "external network")
            .await?;
        self.recorder.record(ComputeStage::ExternalNetworkResolved)?;

        let address = self
            .session
            .create_floating_ip(&external.id, self.name)
            .await
            .map_err(ProbeFailure::cloud("failed to allocate floating address"))?;
        self.register(ResourceKind::FloatingIp, &address.id, |session, id| async move {
            session.delete_floating_ip(&id).await
        });
        self.recorder.record(ComputeStage::FloatingAddressAllocated)?;

        let volume = self
            .session
            .create_volume(&VolumeRequest {
                name: self.name.to_string(),
                description: format!("boot volume for {}", self.name),
                size: self.config.volume_size_gb,
                image_id: image.id.clone(),
            })
            .await
            .map_err(ProbeFailure::cloud("failed to create boot volume"))?;
        self.register(ResourceKind::Volume, &volume.id, |session, id| async move {
            tolerate_in_use(session.delete_volume(&id).await, ResourceKind::Volume, &id)
        });
        let volume = self.wait_for_volume(&volume.id).await?;

        let server = self
            .session
            .create_server(&ServerRequest {
                name: self.name.to_string(),
                flavor_id: flavor.id.clone(),
                network_id: network.id.clone(),
                security_group: group.name.clone(),
                key_name: keypair.name.clone(),
                volume_id: volume.id.clone(),
            })
            .await
            .map_err(ProbeFailure::cloud("failed to create server"))?;
        self.register(ResourceKind::Server, &server.id, |session, id| async move {
            session.delete_server(&id).await
        });
        self.recorder.record(ComputeStage::ServerCreateRequested)?;

        let server = self.wait_for_active(&server.id).await?;
        self.recorder.record(ComputeStage::ServerActive)?;

        let address = self.associate(&server, &address).await?;
        self.recorder.record(ComputeStage::FloatingAddressAssociated)?;

        self.wait_for_console(&server.id).await?;
        self.recorder.record(ComputeStage::ConsoleOutputObserved)?;

        let host_keys = self.wait_for_host_keys(&server.id).await?;
        self.recorder.record(ComputeStage::HostKeysRetrieved)?;

        self.verify_login(&address, &key, &host_keys).await?;
        self.recorder.record(ComputeStage::RemoteLoginVerified)?;

        self.recorder.record(ComputeStage::End)
    }

    fn register<F, Fut>(&mut self, kind: ResourceKind, id: &str, delete: F)
    where
        F: FnOnce(Arc<dyn CloudSession>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CloudResult<()>> + Send + 'static,
    {
        log_debug(
            COMPONENT,
            "Created probe resource",
            &[("kind", kind.as_label()), ("id", id)],
        );
        let session = self.session.clone();
        let owned = id.to_string();
        self.compensations
            .push(kind, id, move || delete(session, owned));
    }

    fn deadline(&self) -> Deadline {
        self.recorder.deadline().clone()
    }

    async fn resolve_network(&self, name: &str, what: &'static str) -> ProbeResult<Network> {
        let networks = self
            .session
            .list_networks()
            .await
            .map_err(ProbeFailure::cloud("failed to list networks"))?;
        find_named(networks, name, what, |network| &network.name)
    }

    async fn wait_for_volume(&self, id: &str) -> ProbeResult<Volume> {
        let session = &self.session;
        let stage = ComputeStage::ServerCreateRequested.as_label();
        poll_until(&self.deadline(), self.config.poll_interval, stage, move || async move {
            match session.get_volume(id).await {
                Ok(volume) if volume.status == "available" => Ok(Some(volume)),
                Ok(volume) if volume.status == "error" => Err(ProbeFailure::Provisioning(
                    format!("boot volume {} entered error state", volume.id),
                )),
                Ok(_) => Ok(None),
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Volume lookup failed",
                        &[("id", id), ("error", &err.to_string())],
                    );
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn wait_for_active(&self, id: &str) -> ProbeResult<Server> {
        let session = &self.session;
        let stage = ComputeStage::ServerActive.as_label();
        poll_until(&self.deadline(), self.config.poll_interval, stage, move || async move {
            match session.get_server(id).await {
                Ok(server) if server.status == "ACTIVE" => Ok(Some(server)),
                Ok(server) if server.status == "ERROR" => {
                    let fault = server
                        .fault
                        .map(|fault| fault.message)
                        .filter(|message| !message.is_empty())
                        .unwrap_or_else(|| "no fault reported".to_string());
                    Err(ProbeFailure::Provisioning(format!(
                        "server entered ERROR state: {fault}"
                    )))
                }
                Ok(_) => Ok(None),
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Server lookup failed",
                        &[("id", id), ("error", &err.to_string())],
                    );
                    Ok(None)
                }
            }
        })
        .await
    }

    /// Binds the floating address to the server's first port. The port
    /// listing may lag behind the server status, so it is polled.
    async fn associate(&self, server: &Server, address: &FloatingIp) -> ProbeResult<FloatingIp> {
        let session = &self.session;
        let server_id = server.id.as_str();
        let stage = ComputeStage::FloatingAddressAssociated.as_label();
        let deadline = self.deadline();
        let port = poll_until(&deadline, self.config.poll_interval, stage, move || async move {
            match session.list_ports(server_id).await {
                Ok(ports) => Ok(ports.into_iter().next()),
                Err(err) if err.is_transient() => Ok(None),
                Err(err) => Err(ProbeFailure::cloud("failed to list server ports")(err)),
            }
        })
        .await?;

        self.session
            .associate_floating_ip(&address.id, &port.id)
            .await
            .map_err(ProbeFailure::cloud("failed to associate floating address"))
    }

    async fn wait_for_console(&self, id: &str) -> ProbeResult<String> {
        let session = &self.session;
        let stage = ComputeStage::ConsoleOutputObserved.as_label();
        poll_until(&self.deadline(), self.config.poll_interval, stage, move || async move {
            match session.console_output(id).await {
                Ok(output) if !output.is_empty() => Ok(Some(output)),
                Ok(_) => Ok(None),
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Console output unavailable",
                        &[("error", &err.to_string())],
                    );
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn wait_for_host_keys(&self, id: &str) -> ProbeResult<Vec<HostKey>> {
        let session = &self.session;
        let stage = ComputeStage::HostKeysRetrieved.as_label();
        let deadline = self.deadline();
        let lines = poll_until(&deadline, self.config.poll_interval, stage, move || async move {
            match session.console_output(id).await {
                Ok(output) => Ok(host_key_block(&output)
                    .map(|lines| lines.into_iter().map(str::to_string).collect::<Vec<_>>())),
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Console output unavailable",
                        &[("error", &err.to_string())],
                    );
                    Ok(None)
                }
            }
        })
        .await?;

        let keys = parse_host_keys(&lines);
        if keys.is_empty() {
            log_warn(
                COMPONENT,
                "Console printed no usable host keys; login will not pin the host key",
                &[],
            );
        }
        Ok(keys)
    }

    async fn verify_login(
        &self,
        address: &FloatingIp,
        key: &ClientKey,
        host_keys: &[HostKey],
    ) -> ProbeResult<()> {
        let ip: IpAddr = address.floating_ip_address.parse().map_err(|_| {
            ProbeFailure::Invalid(format!(
                "floating address {:?} is not an IP address",
                address.floating_ip_address
            ))
        })?;
        let target = &LoginTarget {
            address: SocketAddr::new(ip, self.config.login_port),
            user: self.config.login_user.clone(),
        };
        let login = self.login;
        let command = self.config.login_command.as_str();
        let stage = ComputeStage::RemoteLoginVerified.as_label();
        let deadline = self.deadline();

        let output = poll_until(&deadline, self.config.poll_interval, stage, move || async move {
            let mut connection = match login.dial(target, key, host_keys).await {
                Ok(connection) => connection,
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Remote login attempt failed",
                        &[("error", &err.to_string())],
                    );
                    return Ok(None);
                }
            };
            let result = connection.run(command).await;
            connection.close().await;
            match result {
                Ok(output) => Ok(Some(output)),
                Err(err) => {
                    log_debug(
                        COMPONENT,
                        "Remote command failed",
                        &[("error", &err.to_string())],
                    );
                    Ok(None)
                }
            }
        })
        .await?;

        log_info(
            COMPONENT,
            "Remote login verified",
            &[("address", &target.address.to_string()), ("output", &output)],
        );
        Ok(())
    }
}

fn find_named<T>(
    items: Vec<T>,
    name: &str,
    what: &'static str,
    field: impl Fn(&T) -> &String,
) -> ProbeResult<T> {
    items
        .into_iter()
        .find(|item| field(item) == name)
        .ok_or_else(|| ProbeFailure::not_found(what, name))
}

fn parse_host_keys(lines: &[String]) -> Vec<HostKey> {
    lines
        .iter()
        .filter_map(|line| match HostKey::parse(line) {
            Ok(key) => Some(key),
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Dropping unparseable host key line",
                    &[("line", line), ("error", &err.to_string())],
                );
                None
            }
        })
        .collect()
}

/// Deletes rejected because a dependent resource still exists are reclaimed
/// once the server is gone, by the collector if not sooner.
fn tolerate_in_use(result: CloudResult<()>, kind: ResourceKind, id: &str) -> CloudResult<()> {
    match result {
        Err(err) if err.is_in_use() => {
            log_info(
                COMPONENT,
                "Resource still in use, leaving it to the garbage collector",
                &[("kind", kind.as_label()), ("id", id)],
            );
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprobe::openstack::CloudError;
    use reqwest::StatusCode;

    #[test]
    fn stage_labels_are_unique_and_ordered() {
        let labels: Vec<&str> = ComputeStage::ALL.iter().map(|stage| stage.as_label()).collect();
        let mut unique = labels.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), labels.len());
        assert_eq!(labels.first(), Some(&"start"));
        assert_eq!(labels.last(), Some(&"end"));
    }

    #[test]
    fn host_key_lines_that_fail_to_parse_are_dropped() {
        let key = ClientKey::generate("vm").expect("key");
        let lines = vec![
            key.authorized_key().to_string(),
            "ssh-rsa not-base64!".to_string(),
        ];
        let keys = parse_host_keys(&lines);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].algorithm(), "ssh-ed25519");
    }

    #[test]
    fn in_use_deletes_are_tolerated() {
        let busy = CloudError::status("network", StatusCode::CONFLICT, "SecurityGroupInUse");
        assert!(tolerate_in_use(Err(busy), ResourceKind::SecurityGroup, "sg").is_ok());

        let down = CloudError::status("network", StatusCode::BAD_GATEWAY, "");
        assert!(tolerate_in_use(Err(down), ResourceKind::SecurityGroup, "sg").is_err());
    }

    #[test]
    fn unrelated_conflicts_fail_the_compensation() {
        let quota = r#"{"NeutronError": {"type": "QuotaExceeded", "message": "quota"}}"#;
        let conflict = CloudError::status("network", StatusCode::CONFLICT, quota);
        assert!(tolerate_in_use(Err(conflict), ResourceKind::SecurityGroup, "sg").is_err());

        let state = CloudError::status("volume", StatusCode::CONFLICT, "Volume is migrating");
        assert!(tolerate_in_use(Err(state), ResourceKind::Volume, "vol").is_err());
    }
}
