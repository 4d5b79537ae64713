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

//! reqwest implementation of the service traits against the public REST APIs
//! (Glance v2, Nova v2.1, Neutron v2.0, Cinder v3, Swift v1).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use super::types::{
    ContainerDetail, ContainerInfo, Flavor, FloatingIp, Image, KeyPair, Network, ObjectBody,
    ObjectInfo, Port, SecurityGroup, SecurityRule, SecurityRuleRequest, Server, ServerRequest,
    Volume, VolumeRequest,
};
use super::{CloudError, CloudResult, ComputeApi, ImageApi, NetworkApi, ObjectStoreApi, VolumeApi};
use crate::cloudprobe::logger::{log_debug, log_warn};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const MAX_PAGES: usize = 100;
const SWIFT_PAGE_LIMIT: usize = 1000;

/// Service endpoints taken from the token catalog. Missing services only
/// fail the calls that need them.
#[derive(Clone, Debug, Default)]
pub struct Endpoints {
    pub image: Option<String>,
    pub compute: Option<String>,
    pub network: Option<String>,
    pub volume: Option<String>,
    pub object_store: Option<String>,
}

#[derive(Clone, Copy, Debug)]
enum Service {
    Image,
    Compute,
    Network,
    Volume,
    ObjectStore,
}

impl Service {
    fn as_label(self) -> &'static str {
        match self {
            Service::Image => "image",
            Service::Compute => "compute",
            Service::Network => "network",
            Service::Volume => "volume",
            Service::ObjectStore => "object-store",
        }
    }
}

pub struct OpenStackSession {
    http: Client,
    token: String,
    endpoints: Endpoints,
}

#[derive(Deserialize)]
struct KeyPairEntry {
    keypair: KeyPair,
}

impl OpenStackSession {
    pub fn new(http: Client, token: String, endpoints: Endpoints) -> Self {
        Self {
            http,
            token,
            endpoints,
        }
    }

    fn url(&self, service: Service, segments: &[&str]) -> CloudResult<Url> {
        let base = match service {
            Service::Image => self.endpoints.image.as_deref(),
            Service::Compute => self.endpoints.compute.as_deref(),
            Service::Network => self.endpoints.network.as_deref(),
            Service::Volume => self.endpoints.volume.as_deref(),
            Service::ObjectStore => self.endpoints.object_store.as_deref(),
        }
        .ok_or(CloudError::MissingEndpoint(service.as_label()))?;

        let mut url = Url::parse(base).map_err(|err| {
            CloudError::decode(service.as_label(), format!("invalid endpoint {base}: {err}"))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                CloudError::decode(service.as_label(), format!("endpoint {base} has no path"))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, service: Service, request: RequestBuilder) -> CloudResult<Response> {
        let response = request
            .header(AUTH_TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|source| CloudError::Transport {
                service: service.as_label(),
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CloudError::status(service.as_label(), status, &body))
    }

    /// GET with a short retry on throttling, 5xx and connection failures.
    /// Mutating calls are never retried here.
    async fn get(&self, service: Service, url: Url) -> CloudResult<Response> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send(service, self.http.get(url.clone())).await {
                Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                    log_debug(
                        "openstack",
                        "Retrying read after transient failure",
                        &[("service", service.as_label()), ("error", &err.to_string())],
                    );
                    sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
                other => return other,
            }
        }
    }

    async fn get_field<T: DeserializeOwned>(
        &self,
        service: Service,
        url: Url,
        field: &str,
    ) -> CloudResult<T> {
        let response = self.get(service, url).await?;
        decode_field(service, response, field).await
    }

    async fn send_field<T: DeserializeOwned>(
        &self,
        service: Service,
        request: RequestBuilder,
        field: &str,
    ) -> CloudResult<T> {
        let response = self.send(service, request).await?;
        decode_field(service, response, field).await
    }

    async fn send_empty(&self, service: Service, request: RequestBuilder) -> CloudResult<()> {
        self.send(service, request).await.map(|_| ())
    }

    /// Follows Nova/Neutron/Cinder style `<field>_links` pagination.
    async fn list_pages<T: DeserializeOwned>(
        &self,
        service: Service,
        url: Url,
        field: &str,
    ) -> CloudResult<Vec<T>> {
        let links_field = format!("{field}_links");
        let mut items = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            let page: Value = decode(service, self.get(service, url.clone()).await?).await?;
            let batch = page.get(field).cloned().unwrap_or(Value::Array(Vec::new()));
            let batch: Vec<T> = serde_json::from_value(batch)
                .map_err(|err| CloudError::decode(service.as_label(), err))?;
            items.extend(batch);

            let href = page
                .get(&links_field)
                .and_then(Value::as_array)
                .and_then(|links| {
                    links
                        .iter()
                        .find(|link| link.get("rel").and_then(Value::as_str) == Some("next"))
                })
                .and_then(|link| link.get("href"))
                .and_then(Value::as_str);
            if let Some(href) = href {
                let candidate = Url::parse(href)
                    .map_err(|err| CloudError::decode(service.as_label(), err))?;
                next = next_page(service, &url, candidate, pages);
            }
        }
        Ok(items)
    }

    /// Swift listings page with `marker` until a short page is returned.
    async fn list_swift<T, F>(
        &self,
        mut url: Url,
        prefix: Option<&str>,
        name: F,
    ) -> CloudResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> &str,
    {
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("limit", &SWIFT_PAGE_LIMIT.to_string());
        if let Some(prefix) = prefix {
            url.query_pairs_mut().append_pair("prefix", prefix);
        }

        let mut items: Vec<T> = Vec::new();
        let mut pages = 0;
        loop {
            pages += 1;
            let mut page_url = url.clone();
            if let Some(last) = items.last() {
                page_url.query_pairs_mut().append_pair("marker", name(last));
            }
            let response = self.get(Service::ObjectStore, page_url).await?;
            let body = response.bytes().await.map_err(|source| CloudError::Transport {
                service: Service::ObjectStore.as_label(),
                source,
            })?;
            if body.is_empty() {
                break;
            }
            let page: Vec<T> = serde_json::from_slice(&body)
                .map_err(|err| CloudError::decode(Service::ObjectStore.as_label(), err))?;
            let short = page.len() < SWIFT_PAGE_LIMIT;
            items.extend(page);
            if short {
                break;
            }
            if pages >= MAX_PAGES {
                let marker = items.last().map(|last| name(last)).unwrap_or_default();
                warn_truncated(Service::ObjectStore, pages, marker);
                break;
            }
        }
        Ok(items)
    }
}

async fn decode<T: DeserializeOwned>(service: Service, response: Response) -> CloudResult<T> {
    response
        .json()
        .await
        .map_err(|err| CloudError::decode(service.as_label(), err))
}

async fn decode_field<T: DeserializeOwned>(
    service: Service,
    response: Response,
    field: &str,
) -> CloudResult<T> {
    let mut body: Value = decode(service, response).await?;
    let value = body
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| CloudError::decode(service.as_label(), format!("missing `{field}`")))?;
    serde_json::from_value(value).map_err(|err| CloudError::decode(service.as_label(), err))
}

/// Next `*_links` page, or `None` when the link repeats the current page or
/// the page limit is reached.
fn next_page(service: Service, current: &Url, candidate: Url, pages: usize) -> Option<Url> {
    if candidate == *current {
        return None;
    }
    if pages >= MAX_PAGES {
        warn_truncated(service, pages, candidate.as_str());
        return None;
    }
    Some(candidate)
}

fn warn_truncated(service: Service, pages: usize, next: &str) {
    log_warn(
        "openstack",
        "Listing truncated at page limit; later resources are skipped",
        &[
            ("service", service.as_label()),
            ("pages", &pages.to_string()),
            ("next", next),
        ],
    );
}

fn next_backoff(current: Duration) -> Duration {
    current
        .checked_mul(2)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Swift `X-Timestamp` values are fractional unix seconds.
fn parse_swift_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let nanos = (seconds.fract() * 1e9) as u32;
    Utc.timestamp_opt(seconds.trunc() as i64, nanos).single()
}

fn container_detail_from(headers: &HeaderMap) -> ContainerDetail {
    let object_count =
        header_str(headers, "X-Container-Object-Count").and_then(|v| v.trim().parse().ok());
    let last_modified = header_str(headers, "Last-Modified")
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .or_else(|| header_str(headers, "X-Timestamp").and_then(parse_swift_timestamp));
    ContainerDetail {
        object_count,
        last_modified,
    }
}

#[async_trait]
impl ImageApi for OpenStackSession {
    async fn list_images(&self, name: &str) -> CloudResult<Vec<Image>> {
        let mut url = self.url(Service::Image, &["images"])?;
        url.query_pairs_mut().append_pair("name", name);
        self.get_field(Service::Image, url, "images").await
    }
}

#[async_trait]
impl ComputeApi for OpenStackSession {
    async fn list_flavors(&self) -> CloudResult<Vec<Flavor>> {
        let url = self.url(Service::Compute, &["flavors", "detail"])?;
        self.list_pages(Service::Compute, url, "flavors").await
    }

    async fn list_keypairs(&self) -> CloudResult<Vec<KeyPair>> {
        let url = self.url(Service::Compute, &["os-keypairs"])?;
        let entries: Vec<KeyPairEntry> = self.list_pages(Service::Compute, url, "keypairs").await?;
        Ok(entries.into_iter().map(|entry| entry.keypair).collect())
    }

    async fn create_keypair(&self, name: &str, public_key: &str) -> CloudResult<KeyPair> {
        let url = self.url(Service::Compute, &["os-keypairs"])?;
        let body = json!({ "keypair": { "name": name, "public_key": public_key } });
        self.send_field(Service::Compute, self.http.post(url).json(&body), "keypair")
            .await
    }

    async fn delete_keypair(&self, name: &str) -> CloudResult<()> {
        let url = self.url(Service::Compute, &["os-keypairs", name])?;
        self.send_empty(Service::Compute, self.http.delete(url)).await
    }

    async fn list_servers(&self) -> CloudResult<Vec<Server>> {
        let url = self.url(Service::Compute, &["servers", "detail"])?;
        self.list_pages(Service::Compute, url, "servers").await
    }

    async fn create_server(&self, request: &ServerRequest) -> CloudResult<Server> {
        let url = self.url(Service::Compute, &["servers"])?;
        let body = json!({
            "server": {
                "name": request.name,
                "flavorRef": request.flavor_id,
                "imageRef": "",
                "key_name": request.key_name,
                "networks": [{ "uuid": request.network_id }],
                "security_groups": [{ "name": request.security_group }],
                "block_device_mapping_v2": [{
                    "boot_index": 0,
                    "uuid": request.volume_id,
                    "source_type": "volume",
                    "destination_type": "volume",
                    "delete_on_termination": true,
                }],
            }
        });
        self.send_field(Service::Compute, self.http.post(url).json(&body), "server")
            .await
    }

    async fn get_server(&self, id: &str) -> CloudResult<Server> {
        let url = self.url(Service::Compute, &["servers", id])?;
        self.get_field(Service::Compute, url, "server").await
    }

    async fn delete_server(&self, id: &str) -> CloudResult<()> {
        let url = self.url(Service::Compute, &["servers", id])?;
        self.send_empty(Service::Compute, self.http.delete(url)).await
    }

    async fn console_output(&self, id: &str) -> CloudResult<String> {
        let url = self.url(Service::Compute, &["servers", id, "action"])?;
        let body = json!({ "os-getConsoleOutput": {} });
        self.send_field(Service::Compute, self.http.post(url).json(&body), "output")
            .await
    }
}

#[async_trait]
impl NetworkApi for OpenStackSession {
    async fn list_networks(&self) -> CloudResult<Vec<Network>> {
        let url = self.url(Service::Network, &["networks"])?;
        self.list_pages(Service::Network, url, "networks").await
    }

    async fn list_ports(&self, device_id: &str) -> CloudResult<Vec<Port>> {
        let mut url = self.url(Service::Network, &["ports"])?;
        url.query_pairs_mut().append_pair("device_id", device_id);
        self.list_pages(Service::Network, url, "ports").await
    }

    async fn list_security_groups(&self) -> CloudResult<Vec<SecurityGroup>> {
        let url = self.url(Service::Network, &["security-groups"])?;
        self.list_pages(Service::Network, url, "security_groups").await
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> CloudResult<SecurityGroup> {
        let url = self.url(Service::Network, &["security-groups"])?;
        let body = json!({ "security_group": { "name": name, "description": description } });
        self.send_field(Service::Network, self.http.post(url).json(&body), "security_group")
            .await
    }

    async fn delete_security_group(&self, id: &str) -> CloudResult<()> {
        let url = self.url(Service::Network, &["security-groups", id])?;
        self.send_empty(Service::Network, self.http.delete(url)).await
    }

    async fn create_security_rule(
        &self,
        request: &SecurityRuleRequest,
    ) -> CloudResult<SecurityRule> {
        let url = self.url(Service::Network, &["security-group-rules"])?;
        let body = json!({ "security_group_rule": request });
        self.send_field(
            Service::Network,
            self.http.post(url).json(&body),
            "security_group_rule",
        )
        .await
    }

    async fn delete_security_rule(&self, id: &str) -> CloudResult<()> {
        let url = self.url(Service::Network, &["security-group-rules", id])?;
        self.send_empty(Service::Network, self.http.delete(url)).await
    }

    async fn list_floating_ips(&self) -> CloudResult<Vec<FloatingIp>> {
        let url = self.url(Service::Network, &["floatingips"])?;
        self.list_pages(Service::Network, url, "floatingips").await
    }

    async fn create_floating_ip(
        &self,
        network_id: &str,
        description: &str,
    ) -> CloudResult<FloatingIp> {
        let url = self.url(Service::Network, &["floatingips"])?;
        let body = json!({
            "floatingip": { "floating_network_id": network_id, "description": description }
        });
        self.send_field(Service::Network, self.http.post(url).json(&body), "floatingip")
            .await
    }

    async fn associate_floating_ip(&self, id: &str, port_id: &str) -> CloudResult<FloatingIp> {
        let url = self.url(Service::Network, &["floatingips", id])?;
        let body = json!({ "floatingip": { "port_id": port_id } });
        self.send_field(Service::Network, self.http.put(url).json(&body), "floatingip")
            .await
    }

    async fn delete_floating_ip(&self, id: &str) -> CloudResult<()> {
        let url = self.url(Service::Network, &["floatingips", id])?;
        self.send_empty(Service::Network, self.http.delete(url)).await
    }
}

#[async_trait]
impl VolumeApi for OpenStackSession {
    async fn list_volumes(&self) -> CloudResult<Vec<Volume>> {
        let url = self.url(Service::Volume, &["volumes", "detail"])?;
        self.list_pages(Service::Volume, url, "volumes").await
    }

    async fn create_volume(&self, request: &VolumeRequest) -> CloudResult<Volume> {
        let url = self.url(Service::Volume, &["volumes"])?;
        let body = json!({ "volume": request });
        self.send_field(Service::Volume, self.http.post(url).json(&body), "volume")
            .await
    }

    async fn get_volume(&self, id: &str) -> CloudResult<Volume> {
        let url = self.url(Service::Volume, &["volumes", id])?;
        self.get_field(Service::Volume, url, "volume").await
    }

    async fn delete_volume(&self, id: &str) -> CloudResult<()> {
        let url = self.url(Service::Volume, &["volumes", id])?;
        self.send_empty(Service::Volume, self.http.delete(url)).await
    }
}

#[async_trait]
impl ObjectStoreApi for OpenStackSession {
    async fn list_containers(&self, prefix: &str) -> CloudResult<Vec<ContainerInfo>> {
        let url = self.url(Service::ObjectStore, &[])?;
        self.list_swift(url, Some(prefix), |container: &ContainerInfo| {
            container.name.as_str()
        })
        .await
    }

    async fn container_detail(&self, container: &str) -> CloudResult<ContainerDetail> {
        let url = self.url(Service::ObjectStore, &[container])?;
        let response = self.send(Service::ObjectStore, self.http.head(url)).await?;
        Ok(container_detail_from(response.headers()))
    }

    async fn create_container(&self, container: &str) -> CloudResult<()> {
        let url = self.url(Service::ObjectStore, &[container])?;
        self.send_empty(
            Service::ObjectStore,
            self.http.put(url).header(CONTENT_LENGTH, 0),
        )
        .await
    }

    async fn delete_container(&self, container: &str) -> CloudResult<()> {
        let url = self.url(Service::ObjectStore, &[container])?;
        self.send_empty(Service::ObjectStore, self.http.delete(url)).await
    }

    async fn list_objects(&self, container: &str) -> CloudResult<Vec<ObjectInfo>> {
        let url = self.url(Service::ObjectStore, &[container])?;
        self.list_swift(url, None, |object: &ObjectInfo| object.name.as_str())
            .await
    }

    async fn upload_object(
        &self,
        container: &str,
        object: &str,
        body: ObjectBody,
    ) -> CloudResult<()> {
        let url = self.url(Service::ObjectStore, &[container, object])?;
        let request = self
            .http
            .put(url)
            .header(CONTENT_LENGTH, body.length)
            .body(reqwest::Body::wrap_stream(body.stream));
        self.send_empty(Service::ObjectStore, request).await
    }

    async fn download_object(&self, container: &str, object: &str) -> CloudResult<u64> {
        let url = self.url(Service::ObjectStore, &[container, object])?;
        let mut response = self.send(Service::ObjectStore, self.http.get(url)).await?;
        let mut received = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| CloudError::Transport {
                service: Service::ObjectStore.as_label(),
                source,
            })?
        {
            received += chunk.len() as u64;
        }
        Ok(received)
    }

    async fn delete_object(&self, container: &str, object: &str) -> CloudResult<()> {
        let url = self.url(Service::ObjectStore, &[container, object])?;
        self.send_empty(Service::ObjectStore, self.http.delete(url)).await
    }
}
