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

//! OpenStack control-plane seam. Probes and the collector talk to the cloud
//! only through the traits below, so the reqwest client can be swapped for
//! the in-memory fake in tests.

pub mod auth;
pub mod client;
pub mod error;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::{CloudError, CloudResult};
use types::{
    ContainerDetail, ContainerInfo, Flavor, FloatingIp, Image, KeyPair, Network, ObjectBody,
    ObjectInfo, Port, SecurityGroup, SecurityRule, SecurityRuleRequest, Server, ServerRequest,
    Volume, VolumeRequest,
};

/// Resource kinds created by the probes and reclaimed by the collector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Server,
    SecurityGroup,
    SecurityRule,
    Keypair,
    FloatingIp,
    Volume,
    Container,
    Object,
}

impl ResourceKind {
    pub fn as_label(self) -> &'static str {
        match self {
            ResourceKind::Server => "server",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::SecurityRule => "security_rule",
            ResourceKind::Keypair => "keypair",
            ResourceKind::FloatingIp => "floating_ip",
            ResourceKind::Volume => "volume",
            ResourceKind::Container => "container",
            ResourceKind::Object => "object",
        }
    }
}

#[async_trait]
pub trait ImageApi: Send + Sync {
    /// Lists images whose name equals `name` as far as the service filters.
    async fn list_images(&self, name: &str) -> CloudResult<Vec<Image>>;
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn list_flavors(&self) -> CloudResult<Vec<Flavor>>;
    async fn list_keypairs(&self) -> CloudResult<Vec<KeyPair>>;
    async fn create_keypair(&self, name: &str, public_key: &str) -> CloudResult<KeyPair>;
    async fn delete_keypair(&self, name: &str) -> CloudResult<()>;
    async fn list_servers(&self) -> CloudResult<Vec<Server>>;
    async fn create_server(&self, request: &ServerRequest) -> CloudResult<Server>;
    async fn get_server(&self, id: &str) -> CloudResult<Server>;
    async fn delete_server(&self, id: &str) -> CloudResult<()>;
    async fn console_output(&self, id: &str) -> CloudResult<String>;
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn list_networks(&self) -> CloudResult<Vec<Network>>;
    async fn list_ports(&self, device_id: &str) -> CloudResult<Vec<Port>>;
    async fn list_security_groups(&self) -> CloudResult<Vec<SecurityGroup>>;
    async fn create_security_group(&self, name: &str, description: &str)
        -> CloudResult<SecurityGroup>;
    async fn delete_security_group(&self, id: &str) -> CloudResult<()>;
    async fn create_security_rule(&self, request: &SecurityRuleRequest)
        -> CloudResult<SecurityRule>;
    async fn delete_security_rule(&self, id: &str) -> CloudResult<()>;
    async fn list_floating_ips(&self) -> CloudResult<Vec<FloatingIp>>;
    async fn create_floating_ip(&self, network_id: &str, description: &str)
        -> CloudResult<FloatingIp>;
    async fn associate_floating_ip(&self, id: &str, port_id: &str) -> CloudResult<FloatingIp>;
    async fn delete_floating_ip(&self, id: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn list_volumes(&self) -> CloudResult<Vec<Volume>>;
    async fn create_volume(&self, request: &VolumeRequest) -> CloudResult<Volume>;
    async fn get_volume(&self, id: &str) -> CloudResult<Volume>;
    async fn delete_volume(&self, id: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    async fn list_containers(&self, prefix: &str) -> CloudResult<Vec<ContainerInfo>>;
    async fn container_detail(&self, container: &str) -> CloudResult<ContainerDetail>;
    async fn create_container(&self, container: &str) -> CloudResult<()>;
    async fn delete_container(&self, container: &str) -> CloudResult<()>;
    async fn list_objects(&self, container: &str) -> CloudResult<Vec<ObjectInfo>>;
    async fn upload_object(&self, container: &str, object: &str, body: ObjectBody)
        -> CloudResult<()>;
    /// Streams the object and returns the number of bytes received. The bytes
    /// themselves are discarded.
    async fn download_object(&self, container: &str, object: &str) -> CloudResult<u64>;
    async fn delete_object(&self, container: &str, object: &str) -> CloudResult<()>;
}

/// An authenticated view of one project across all services.
pub trait CloudSession: ImageApi + ComputeApi + NetworkApi + VolumeApi + ObjectStoreApi {}

impl<T> CloudSession for T where
    T: ImageApi + ComputeApi + NetworkApi + VolumeApi + ObjectStoreApi
{
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Obtains a fresh token. Probe runs and collector sweeps each call this
    /// once, so token expiry never spans more than one unit of work.
    async fn authenticate(&self) -> CloudResult<Arc<dyn CloudSession>>;
}
