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

#![allow(dead_code)]

//! In-memory cloud and login doubles shared by unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::StatusCode;

use crate::cloudprobe::openstack::types::{
    ContainerDetail, ContainerInfo, Flavor, FloatingIp, Image, KeyPair, Network, ObjectBody,
    ObjectInfo, Port, SecurityGroup, SecurityRule, SecurityRuleRequest, Server, ServerFault,
    ServerRequest, Volume, VolumeRequest,
};
use crate::cloudprobe::openstack::{
    CloudError, CloudProvider, CloudResult, CloudSession, ComputeApi, ImageApi, NetworkApi,
    ObjectStoreApi, VolumeApi,
};
use crate::cloudprobe::ssh::{
    ClientKey, HostKey, LoginError, LoginTarget, RemoteConnection, RemoteLogin,
};

pub const FAKE_IMAGE: &str = "ubuntu-16.04-x86_64";
pub const FAKE_FLAVOR: &str = "t2.small";
pub const FAKE_NETWORK: &str = "private";
pub const FAKE_EXTERNAL_NETWORK: &str = "internet";

struct InjectedFailure {
    status: StatusCode,
    message: String,
    remaining: Option<usize>,
}

#[derive(Clone)]
struct FakeObject {
    bytes: u64,
    last_modified: DateTime<Utc>,
}

/// Containers keep their creation time as last modification time.
#[derive(Clone, Default)]
struct FakeContainer {
    objects: BTreeMap<String, FakeObject>,
    last_modified: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    calls: Vec<String>,
    failures: HashMap<&'static str, InjectedFailure>,
    delays: HashMap<&'static str, Duration>,
    auth_failure: Option<String>,
    clock: Option<DateTime<Utc>>,
    images: Vec<Image>,
    flavors: Vec<Flavor>,
    networks: Vec<Network>,
    servers: BTreeMap<String, Server>,
    server_groups: HashMap<String, String>,
    server_statuses: Vec<String>,
    settled_server_status: String,
    console: String,
    security_groups: BTreeMap<String, SecurityGroup>,
    rules: BTreeMap<String, SecurityRule>,
    in_use_groups: BTreeSet<String>,
    keypairs: BTreeMap<String, KeyPair>,
    floating_ips: BTreeMap<String, FloatingIp>,
    volumes: BTreeMap<String, Volume>,
    containers: BTreeMap<String, FakeContainer>,
    unreadable_counts: bool,
}

impl FakeState {
    fn id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{kind}-{}", self.next_id)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }
}

fn missing(service: &'static str, what: &str) -> CloudError {
    CloudError::status(service, StatusCode::NOT_FOUND, &format!("{what} could not be found"))
}

/// A single project's worth of OpenStack state. Clones share the same state,
/// so tests keep one handle for inspection and hand another to the code
/// under test.
#[derive(Clone)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    /// A cloud seeded with the image, flavor and networks of the default
    /// probe configuration, whose console prints one host key.
    pub fn new() -> Self {
        let cloud = Self::bare();
        {
            let mut state = cloud.lock();
            state.images.push(Image {
                id: "image-1".to_string(),
                name: FAKE_IMAGE.to_string(),
                status: "active".to_string(),
            });
            state.flavors.push(Flavor {
                id: "flavor-1".to_string(),
                name: FAKE_FLAVOR.to_string(),
            });
            state.networks.push(Network {
                id: "network-1".to_string(),
                name: FAKE_NETWORK.to_string(),
                external: false,
            });
            state.networks.push(Network {
                id: "network-2".to_string(),
                name: FAKE_EXTERNAL_NETWORK.to_string(),
                external: true,
            });
        }
        cloud.set_console(&console_with_host_keys(&[&fake_host_key_line()]));
        cloud
    }

    /// A cloud with nothing in it.
    pub fn bare() -> Self {
        let state = FakeState {
            settled_server_status: "ACTIVE".to_string(),
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn provider(&self) -> Arc<dyn CloudProvider> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every call made so far as `"<operation> <subject>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn called(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .count()
    }

    /// Fails every call to `operation` with `status`.
    pub fn fail(&self, operation: &'static str, status: StatusCode, message: &str) {
        self.inject(operation, status, message, None);
    }

    /// Fails the next `times` calls to `operation` with `status`.
    pub fn fail_times(
        &self,
        operation: &'static str,
        times: usize,
        status: StatusCode,
        message: &str,
    ) {
        self.inject(operation, status, message, Some(times));
    }

    fn inject(
        &self,
        operation: &'static str,
        status: StatusCode,
        message: &str,
        remaining: Option<usize>,
    ) {
        self.lock().failures.insert(
            operation,
            InjectedFailure {
                status,
                message: message.to_string(),
                remaining,
            },
        );
    }

    pub fn clear_failure(&self, operation: &str) {
        self.lock().failures.remove(operation);
    }

    pub fn fail_auth(&self, message: &str) {
        self.lock().auth_failure = Some(message.to_string());
    }

    /// Makes every call to `operation` take `delay` before it answers.
    pub fn delay(&self, operation: &'static str, delay: Duration) {
        self.lock().delays.insert(operation, delay);
    }

    /// Pins the platform clock used for object store timestamps.
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.lock().clock = Some(now);
    }

    pub fn set_images(&self, names: &[&str]) {
        let mut state = self.lock();
        state.images = names
            .iter()
            .enumerate()
            .map(|(index, name)| Image {
                id: format!("image-{}", index + 1),
                name: name.to_string(),
                status: "active".to_string(),
            })
            .collect();
    }

    /// Statuses returned by successive server lookups before the server
    /// settles in its final status.
    pub fn server_statuses(&self, statuses: &[&str]) {
        self.lock().server_statuses = statuses.iter().rev().map(|s| s.to_string()).collect();
    }

    /// Status servers report once the scripted statuses are exhausted.
    pub fn settle_servers_in(&self, status: &str) {
        self.lock().settled_server_status = status.to_string();
    }

    pub fn set_console(&self, output: &str) {
        self.lock().console = output.to_string();
    }

    pub fn mark_in_use(&self, group_name: &str) {
        self.lock().in_use_groups.insert(group_name.to_string());
    }

    pub fn release(&self, group_name: &str) {
        self.lock().in_use_groups.remove(group_name);
    }

    pub fn set_unreadable_counts(&self, unreadable: bool) {
        self.lock().unreadable_counts = unreadable;
    }

    pub fn seed_server(&self, name: &str, status: &str) -> String {
        let mut state = self.lock();
        let id = state.id("server");
        state.servers.insert(
            id.clone(),
            Server {
                id: id.clone(),
                name: name.to_string(),
                status: status.to_string(),
                fault: None,
            },
        );
        id
    }

    pub fn seed_security_group(&self, name: &str) -> String {
        let mut state = self.lock();
        let id = state.id("sg");
        state.security_groups.insert(
            id.clone(),
            SecurityGroup {
                id: id.clone(),
                name: name.to_string(),
                description: String::new(),
            },
        );
        id
    }

    pub fn seed_keypair(&self, name: &str) {
        self.lock().keypairs.insert(
            name.to_string(),
            KeyPair {
                name: name.to_string(),
                fingerprint: String::new(),
            },
        );
    }

    pub fn seed_floating_ip(&self, description: &str) -> String {
        let mut state = self.lock();
        let id = state.id("fip");
        let address = format!("203.0.113.{}", state.next_id % 250 + 1);
        state.floating_ips.insert(
            id.clone(),
            FloatingIp {
                id: id.clone(),
                floating_ip_address: address,
                description: description.to_string(),
                port_id: None,
            },
        );
        id
    }

    pub fn seed_volume(&self, name: &str, status: &str) -> String {
        let mut state = self.lock();
        let id = state.id("volume");
        state.volumes.insert(
            id.clone(),
            Volume {
                id: id.clone(),
                name: name.to_string(),
                status: status.to_string(),
            },
        );
        id
    }

    pub fn seed_container(&self, name: &str, last_modified: Option<DateTime<Utc>>) {
        self.lock().containers.insert(
            name.to_string(),
            FakeContainer {
                objects: BTreeMap::new(),
                last_modified,
            },
        );
    }

    pub fn seed_object(&self, container: &str, object: &str, last_modified: DateTime<Utc>) {
        self.lock()
            .containers
            .entry(container.to_string())
            .or_default()
            .objects
            .insert(
                object.to_string(),
                FakeObject {
                    bytes: 0,
                    last_modified,
                },
            );
    }

    pub fn server_names(&self) -> Vec<String> {
        self.lock().servers.values().map(|s| s.name.clone()).collect()
    }

    pub fn security_group_names(&self) -> Vec<String> {
        self.lock()
            .security_groups
            .values()
            .map(|g| g.name.clone())
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.lock().rules.len()
    }

    pub fn keypair_names(&self) -> Vec<String> {
        self.lock().keypairs.keys().cloned().collect()
    }

    pub fn floating_ip_descriptions(&self) -> Vec<String> {
        self.lock()
            .floating_ips
            .values()
            .map(|f| f.description.clone())
            .collect()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.lock().volumes.values().map(|v| v.name.clone()).collect()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn object_names(&self, container: &str) -> Vec<String> {
        self.lock()
            .containers
            .get(container)
            .map(|c| c.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of resources of every kind the probes create.
    pub fn resource_count(&self) -> usize {
        let state = self.lock();
        state.servers.len()
            + state.security_groups.len()
            + state.rules.len()
            + state.keypairs.len()
            + state.floating_ips.len()
            + state.volumes.len()
            + state.containers.len()
    }

    /// Records the call, applies any injected delay and returns the injected
    /// failure, if one is armed.
    async fn enter(&self, operation: &'static str, subject: &str) -> CloudResult<()> {
        let (delay, failure) = {
            let mut state = self.lock();
            let call = if subject.is_empty() {
                operation.to_string()
            } else {
                format!("{operation} {subject}")
            };
            state.calls.push(call);
            let failure = match state.failures.get_mut(operation) {
                Some(failure) => {
                    let error = CloudError::status("fake", failure.status, &failure.message);
                    match failure.remaining.as_mut() {
                        Some(0) => None,
                        Some(remaining) => {
                            *remaining -= 1;
                            Some(error)
                        }
                        None => Some(error),
                    }
                }
                None => None,
            };
            (state.delays.get(operation).copied(), failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn authenticate(&self) -> CloudResult<Arc<dyn CloudSession>> {
        self.enter("authenticate", "").await?;
        if let Some(message) = self.lock().auth_failure.clone() {
            return Err(CloudError::Auth(message));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl ImageApi for FakeCloud {
    async fn list_images(&self, name: &str) -> CloudResult<Vec<Image>> {
        self.enter("list_images", name).await?;
        Ok(self
            .lock()
            .images
            .iter()
            .filter(|image| image.name == name)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ComputeApi for FakeCloud {
    async fn list_flavors(&self) -> CloudResult<Vec<Flavor>> {
        self.enter("list_flavors", "").await?;
        Ok(self.lock().flavors.clone())
    }

    async fn list_keypairs(&self) -> CloudResult<Vec<KeyPair>> {
        self.enter("list_keypairs", "").await?;
        Ok(self.lock().keypairs.values().cloned().collect())
    }

    async fn create_keypair(&self, name: &str, public_key: &str) -> CloudResult<KeyPair> {
        self.enter("create_keypair", name).await?;
        if HostKey::parse(public_key).is_err() {
            return Err(CloudError::status(
                "fake",
                StatusCode::BAD_REQUEST,
                "Keypair data is invalid",
            ));
        }
        let keypair = KeyPair {
            name: name.to_string(),
            fingerprint: String::new(),
        };
        self.lock().keypairs.insert(name.to_string(), keypair.clone());
        Ok(keypair)
    }

    async fn delete_keypair(&self, name: &str) -> CloudResult<()> {
        self.enter("delete_keypair", name).await?;
        match self.lock().keypairs.remove(name) {
            Some(_) => Ok(()),
            None => Err(missing("fake", name)),
        }
    }

    async fn list_servers(&self) -> CloudResult<Vec<Server>> {
        self.enter("list_servers", "").await?;
        Ok(self.lock().servers.values().cloned().collect())
    }

    async fn create_server(&self, request: &ServerRequest) -> CloudResult<Server> {
        self.enter("create_server", &request.name).await?;
        let mut state = self.lock();
        let id = state.id("server");
        let server = Server {
            id: id.clone(),
            name: request.name.clone(),
            status: "BUILD".to_string(),
            fault: None,
        };
        state.servers.insert(id.clone(), server.clone());
        state
            .server_groups
            .insert(id, request.security_group.clone());
        Ok(server)
    }

    async fn get_server(&self, id: &str) -> CloudResult<Server> {
        self.enter("get_server", id).await?;
        let mut state = self.lock();
        let status = state
            .server_statuses
            .pop()
            .unwrap_or_else(|| state.settled_server_status.clone());
        let server = state
            .servers
            .get_mut(id)
            .ok_or_else(|| missing("fake", id))?;
        server.status = status;
        if server.status == "ERROR" {
            server.fault = Some(ServerFault {
                message: "No valid host was found".to_string(),
            });
        }
        Ok(server.clone())
    }

    async fn delete_server(&self, id: &str) -> CloudResult<()> {
        self.enter("delete_server", id).await?;
        let mut state = self.lock();
        state.server_groups.remove(id);
        match state.servers.remove(id) {
            Some(_) => Ok(()),
            None => Err(missing("fake", id)),
        }
    }

    async fn console_output(&self, id: &str) -> CloudResult<String> {
        self.enter("console_output", id).await?;
        let state = self.lock();
        if !state.servers.contains_key(id) {
            return Err(missing("fake", id));
        }
        Ok(state.console.clone())
    }
}

#[async_trait]
impl NetworkApi for FakeCloud {
    async fn list_networks(&self) -> CloudResult<Vec<Network>> {
        self.enter("list_networks", "").await?;
        Ok(self.lock().networks.clone())
    }

    async fn list_ports(&self, device_id: &str) -> CloudResult<Vec<Port>> {
        self.enter("list_ports", device_id).await?;
        let state = self.lock();
        if !state.servers.contains_key(device_id) {
            return Ok(Vec::new());
        }
        Ok(vec![Port {
            id: format!("port-{device_id}"),
            device_id: device_id.to_string(),
        }])
    }

    async fn list_security_groups(&self) -> CloudResult<Vec<SecurityGroup>> {
        self.enter("list_security_groups", "").await?;
        Ok(self.lock().security_groups.values().cloned().collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> CloudResult<SecurityGroup> {
        self.enter("create_security_group", name).await?;
        let mut state = self.lock();
        let id = state.id("sg");
        let group = SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
        };
        state.security_groups.insert(id, group.clone());
        Ok(group)
    }

    async fn delete_security_group(&self, id: &str) -> CloudResult<()> {
        self.enter("delete_security_group", id).await?;
        let mut state = self.lock();
        let name = match state.security_groups.get(id) {
            Some(group) => group.name.clone(),
            None => return Err(missing("fake", id)),
        };
        let attached = state.server_groups.values().any(|group| *group == name);
        if attached || state.in_use_groups.contains(&name) {
            return Err(CloudError::status(
                "fake",
                StatusCode::CONFLICT,
                &format!("Security Group {id} in use."),
            ));
        }
        state.security_groups.remove(id);
        state.rules.retain(|_, rule| rule.security_group_id != id);
        Ok(())
    }

    async fn create_security_rule(
        &self,
        request: &SecurityRuleRequest,
    ) -> CloudResult<SecurityRule> {
        self.enter("create_security_rule", &request.security_group_id)
            .await?;
        let mut state = self.lock();
        if !state.security_groups.contains_key(&request.security_group_id) {
            return Err(missing("fake", &request.security_group_id));
        }
        let id = state.id("rule");
        let rule = SecurityRule {
            id: id.clone(),
            security_group_id: request.security_group_id.clone(),
        };
        state.rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn delete_security_rule(&self, id: &str) -> CloudResult<()> {
        self.enter("delete_security_rule", id).await?;
        match self.lock().rules.remove(id) {
            Some(_) => Ok(()),
            None => Err(missing("fake", id)),
        }
    }

    async fn list_floating_ips(&self) -> CloudResult<Vec<FloatingIp>> {
        self.enter("list_floating_ips", "").await?;
        Ok(self.lock().floating_ips.values().cloned().collect())
    }

    async fn create_floating_ip(
        &self,
        network_id: &str,
        description: &str,
    ) -> CloudResult<FloatingIp> {
        self.enter("create_floating_ip", description).await?;
        let mut state = self.lock();
        if !state.networks.iter().any(|n| n.id == network_id && n.external) {
            return Err(CloudError::status(
                "fake",
                StatusCode::BAD_REQUEST,
                &format!("network {network_id} is not external"),
            ));
        }
        let id = state.id("fip");
        let address = FloatingIp {
            id: id.clone(),
            floating_ip_address: format!("203.0.113.{}", state.next_id % 250 + 1),
            description: description.to_string(),
            port_id: None,
        };
        state.floating_ips.insert(id, address.clone());
        Ok(address)
    }

    async fn associate_floating_ip(&self, id: &str, port_id: &str) -> CloudResult<FloatingIp> {
        self.enter("associate_floating_ip", id).await?;
        let mut state = self.lock();
        let address = state
            .floating_ips
            .get_mut(id)
            .ok_or_else(|| missing("fake", id))?;
        address.port_id = Some(port_id.to_string());
        Ok(address.clone())
    }

    async fn delete_floating_ip(&self, id: &str) -> CloudResult<()> {
        self.enter("delete_floating_ip", id).await?;
        match self.lock().floating_ips.remove(id) {
            Some(_) => Ok(()),
            None => Err(missing("fake", id)),
        }
    }
}

#[async_trait]
impl VolumeApi for FakeCloud {
    async fn list_volumes(&self) -> CloudResult<Vec<Volume>> {
        self.enter("list_volumes", "").await?;
        Ok(self.lock().volumes.values().cloned().collect())
    }

    /// Volumes become available on their first lookup.
    async fn create_volume(&self, request: &VolumeRequest) -> CloudResult<Volume> {
        self.enter("create_volume", &request.name).await?;
        let mut state = self.lock();
        let id = state.id("volume");
        let volume = Volume {
            id: id.clone(),
            name: request.name.clone(),
            status: "creating".to_string(),
        };
        state.volumes.insert(id, volume.clone());
        Ok(volume)
    }

    async fn get_volume(&self, id: &str) -> CloudResult<Volume> {
        self.enter("get_volume", id).await?;
        let mut state = self.lock();
        let volume = state
            .volumes
            .get_mut(id)
            .ok_or_else(|| missing("fake", id))?;
        if volume.status == "creating" {
            volume.status = "available".to_string();
        }
        Ok(volume.clone())
    }

    async fn delete_volume(&self, id: &str) -> CloudResult<()> {
        self.enter("delete_volume", id).await?;
        match self.lock().volumes.remove(id) {
            Some(_) => Ok(()),
            None => Err(missing("fake", id)),
        }
    }
}

#[async_trait]
impl ObjectStoreApi for FakeCloud {
    async fn list_containers(&self, prefix: &str) -> CloudResult<Vec<ContainerInfo>> {
        self.enter("list_containers", prefix).await?;
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, container)| ContainerInfo {
                name: name.clone(),
                count: container.objects.len() as u64,
                bytes: container.objects.values().map(|o| o.bytes).sum(),
            })
            .collect())
    }

    async fn container_detail(&self, container: &str) -> CloudResult<ContainerDetail> {
        self.enter("container_detail", container).await?;
        let state = self.lock();
        let found = state
            .containers
            .get(container)
            .ok_or_else(|| missing("fake", container))?;
        Ok(ContainerDetail {
            object_count: (!state.unreadable_counts).then_some(found.objects.len() as u64),
            last_modified: found.last_modified,
        })
    }

    async fn create_container(&self, container: &str) -> CloudResult<()> {
        self.enter("create_container", container).await?;
        let mut state = self.lock();
        let now = state.now();
        state
            .containers
            .entry(container.to_string())
            .or_default()
            .last_modified = Some(now);
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> CloudResult<()> {
        self.enter("delete_container", container).await?;
        let mut state = self.lock();
        match state.containers.get(container) {
            None => Err(missing("fake", container)),
            Some(found) if !found.objects.is_empty() => Err(CloudError::status(
                "fake",
                StatusCode::CONFLICT,
                "There was a conflict when trying to complete your request.",
            )),
            Some(_) => {
                state.containers.remove(container);
                Ok(())
            }
        }
    }

    async fn list_objects(&self, container: &str) -> CloudResult<Vec<ObjectInfo>> {
        self.enter("list_objects", container).await?;
        let state = self.lock();
        let found = state
            .containers
            .get(container)
            .ok_or_else(|| missing("fake", container))?;
        Ok(found
            .objects
            .iter()
            .map(|(name, object)| ObjectInfo {
                name: name.clone(),
                bytes: object.bytes,
                last_modified: Some(
                    object
                        .last_modified
                        .naive_utc()
                        .format("%Y-%m-%dT%H:%M:%S%.6f")
                        .to_string(),
                ),
            })
            .collect())
    }

    async fn upload_object(
        &self,
        container: &str,
        object: &str,
        body: ObjectBody,
    ) -> CloudResult<()> {
        self.enter("upload_object", object).await?;
        let mut received = 0u64;
        let mut stream = body.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| CloudError::decode("fake", err))?;
            received += chunk.len() as u64;
        }
        let mut state = self.lock();
        let now = state.now();
        let found = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("fake", container))?;
        found.objects.insert(
            object.to_string(),
            FakeObject {
                bytes: received,
                last_modified: now,
            },
        );
        Ok(())
    }

    async fn download_object(&self, container: &str, object: &str) -> CloudResult<u64> {
        self.enter("download_object", object).await?;
        let state = self.lock();
        state
            .containers
            .get(container)
            .and_then(|found| found.objects.get(object))
            .map(|found| found.bytes)
            .ok_or_else(|| missing("fake", object))
    }

    async fn delete_object(&self, container: &str, object: &str) -> CloudResult<()> {
        self.enter("delete_object", object).await?;
        let mut state = self.lock();
        let found = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("fake", container))?;
        match found.objects.remove(object) {
            Some(_) => Ok(()),
            None => Err(missing("fake", object)),
        }
    }
}

/// An `ssh-ed25519` line usable as a host key.
pub fn fake_host_key_line() -> String {
    match ClientKey::generate("root@probe") {
        Ok(key) => key.authorized_key().to_string(),
        Err(err) => panic!("cannot generate host key: {err}"),
    }
}

/// Console output as printed by cloud-init once host keys are generated.
pub fn console_with_host_keys(lines: &[&str]) -> String {
    let mut console =
        String::from("[    0.000000] Linux version 4.4.0\ncloud-init: running modules\n");
    console.push_str("-----BEGIN SSH HOST KEY KEYS-----\n");
    for line in lines {
        console.push_str(line);
        console.push('\n');
    }
    console.push_str("-----END SSH HOST KEY KEYS-----\nlogin: ");
    console
}

#[derive(Default)]
struct LoginState {
    refusals: usize,
    output: String,
    dials: Vec<(LoginTarget, usize)>,
    commands: Vec<String>,
}

/// Remote login double. Refuses a configurable number of dials before
/// accepting and answers every command with a fixed output.
#[derive(Clone)]
pub struct FakeLogin {
    state: Arc<Mutex<LoginState>>,
    closed: Arc<AtomicUsize>,
}

impl Default for FakeLogin {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLogin {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoginState {
                output: "ubuntu".to_string(),
                ..LoginState::default()
            })),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn login(&self) -> Arc<dyn RemoteLogin> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, LoginState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn refuse_first(&self, dials: usize) {
        self.lock().refusals = dials;
    }

    pub fn dial_count(&self) -> usize {
        self.lock().dials.len()
    }

    /// Number of trusted host keys passed to each dial.
    pub fn trusted_counts(&self) -> Vec<usize> {
        self.lock().dials.iter().map(|(_, trusted)| *trusted).collect()
    }

    pub fn targets(&self) -> Vec<LoginTarget> {
        self.lock().dials.iter().map(|(target, _)| target.clone()).collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteLogin for FakeLogin {
    async fn dial(
        &self,
        target: &LoginTarget,
        _key: &ClientKey,
        trusted: &[HostKey],
    ) -> Result<Box<dyn RemoteConnection>, LoginError> {
        let mut state = self.lock();
        state.dials.push((target.clone(), trusted.len()));
        if state.refusals > 0 {
            state.refusals -= 1;
            return Err(LoginError::Dial {
                address: target.address,
                message: "connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeConnection {
            login: self.clone(),
        }))
    }
}

struct FakeConnection {
    login: FakeLogin,
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn run(&mut self, command: &str) -> Result<String, LoginError> {
        let mut state = self.login.lock();
        state.commands.push(command.to_string());
        Ok(state.output.clone())
    }

    async fn close(self: Box<Self>) {
        self.login.closed.fetch_add(1, Ordering::SeqCst);
    }
}
