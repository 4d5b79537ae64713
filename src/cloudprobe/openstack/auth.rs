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

//! Keystone v3 password authentication and service catalog resolution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::client::{Endpoints, OpenStackSession};
use super::{CloudError, CloudProvider, CloudResult, CloudSession};
use crate::cloudprobe::config::CloudCredentials;
use crate::cloudprobe::logger::log_debug;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEndpoint {
    interface: String,
    url: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

/// Authenticates with a project-scoped password token for every session.
pub struct KeystoneProvider {
    http: reqwest::Client,
    credentials: CloudCredentials,
}

impl KeystoneProvider {
    pub fn new(credentials: CloudCredentials, request_timeout: Duration) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("cloudprobe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| CloudError::Transport {
                service: "identity",
                source,
            })?;
        Ok(Self { http, credentials })
    }

    fn tokens_url(&self) -> String {
        let base = self.credentials.auth_url.trim_end_matches('/');
        if base.ends_with("/v3") {
            format!("{base}/auth/tokens")
        } else {
            format!("{base}/v3/auth/tokens")
        }
    }
}

#[async_trait]
impl CloudProvider for KeystoneProvider {
    async fn authenticate(&self) -> CloudResult<Arc<dyn CloudSession>> {
        let credentials = &self.credentials;
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": credentials.username,
                            "domain": { "name": credentials.user_domain_name },
                            "password": credentials.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": credentials.project_name,
                        "domain": { "name": credentials.project_domain_name },
                    }
                }
            }
        });

        let response = self
            .http
            .post(self.tokens_url())
            .json(&body)
            .send()
            .await
            .map_err(|source| CloudError::Transport {
                service: "identity",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(
                CloudError::status("identity", status, &text).to_string(),
            ));
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Auth(format!("response lacks {SUBJECT_TOKEN_HEADER}")))?;
        let envelope: TokenEnvelope = response
            .json()
            .await
            .map_err(|err| CloudError::decode("identity", err))?;

        let endpoints = resolve_endpoints(
            &envelope.token.catalog,
            &credentials.interface,
            credentials.region_name.as_deref(),
        );
        log_debug(
            "openstack",
            "Authenticated against keystone",
            &[
                ("project", credentials.project_name.as_str()),
                ("compute", endpoints.compute.as_deref().unwrap_or("-")),
                ("network", endpoints.network.as_deref().unwrap_or("-")),
            ],
        );

        Ok(Arc::new(OpenStackSession::new(
            self.http.clone(),
            token,
            endpoints,
        )))
    }
}

pub(crate) fn resolve_endpoints(
    catalog: &[CatalogEntry],
    interface: &str,
    region: Option<&str>,
) -> Endpoints {
    let find = |kinds: &[&str]| -> Option<String> {
        catalog
            .iter()
            .filter(|entry| kinds.contains(&entry.kind.as_str()))
            .flat_map(|entry| entry.endpoints.iter())
            .find(|endpoint| {
                endpoint.interface == interface
                    && region.map_or(true, |wanted| {
                        endpoint.region_id.as_deref() == Some(wanted)
                            || endpoint.region.as_deref() == Some(wanted)
                    })
            })
            .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
    };

    Endpoints {
        image: find(&["image"]).map(|url| with_version(url, "/v2")),
        compute: find(&["compute"]),
        network: find(&["network"]).map(|url| with_version(url, "/v2.0")),
        volume: find(&["block-storage", "volumev3"]),
        object_store: find(&["object-store"]),
    }
}

/// Glance and Neutron publish unversioned endpoints in most catalogs.
fn with_version(url: String, version: &str) -> String {
    if url.ends_with(version) {
        url
    } else {
        format!("{url}{version}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<CatalogEntry> {
        serde_json::from_value(json!([
            {"type": "compute", "endpoints": [
                {"interface": "internal", "url": "http://nova.internal:8774/v2.1", "region_id": "one"},
                {"interface": "public", "url": "https://nova.example/v2.1/", "region_id": "one"},
                {"interface": "public", "url": "https://nova.two.example/v2.1", "region_id": "two"}
            ]},
            {"type": "network", "endpoints": [
                {"interface": "public", "url": "https://neutron.example", "region_id": "one"}
            ]},
            {"type": "image", "endpoints": [
                {"interface": "public", "url": "https://glance.example/v2", "region_id": "one"}
            ]},
            {"type": "volumev3", "endpoints": [
                {"interface": "public", "url": "https://cinder.example/v3/p1", "region_id": "one"}
            ]}
        ]))
        .expect("catalog decodes")
    }

    #[test]
    fn endpoints_follow_interface_and_region() {
        let endpoints = resolve_endpoints(&catalog(), "public", Some("two"));
        assert_eq!(endpoints.compute.as_deref(), Some("https://nova.two.example/v2.1"));
        assert_eq!(endpoints.network, None);

        let endpoints = resolve_endpoints(&catalog(), "public", Some("one"));
        assert_eq!(endpoints.compute.as_deref(), Some("https://nova.example/v2.1"));
        assert_eq!(endpoints.network.as_deref(), Some("https://neutron.example/v2.0"));
        assert_eq!(endpoints.image.as_deref(), Some("https://glance.example/v2"));
        assert_eq!(endpoints.volume.as_deref(), Some("https://cinder.example/v3/p1"));
        assert_eq!(endpoints.object_store, None);
    }

    #[test]
    fn tokens_url_accepts_versioned_and_bare_auth_urls() {
        let mut credentials = CloudCredentials {
            auth_url: "https://keystone.example:5000/v3/".to_string(),
            username: "probe".to_string(),
            password: "secret".to_string(),
            user_domain_name: "Default".to_string(),
            project_name: "monitoring".to_string(),
            project_domain_name: "Default".to_string(),
            region_name: None,
            interface: "public".to_string(),
        };
        let provider =
            KeystoneProvider::new(credentials.clone(), Duration::from_secs(5)).expect("client");
        assert_eq!(provider.tokens_url(), "https://keystone.example:5000/v3/auth/tokens");

        credentials.auth_url = "https://keystone.example:5000".to_string();
        let provider = KeystoneProvider::new(credentials, Duration::from_secs(5)).expect("client");
        assert_eq!(provider.tokens_url(), "https://keystone.example:5000/v3/auth/tokens");
    }
}
