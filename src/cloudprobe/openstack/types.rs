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

//! Wire representations of the OpenStack resources the probes touch. Only
//! the fields in use are modelled; everything else is ignored on decode.

use std::fmt;
use std::io;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "router:external")]
    pub external: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SecurityRule {
    pub id: String,
    pub security_group_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SecurityRuleRequest {
    pub security_group_id: String,
    pub direction: &'static str,
    pub ethertype: &'static str,
    pub protocol: &'static str,
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub remote_ip_prefix: &'static str,
}

impl SecurityRuleRequest {
    /// IPv4 TCP ingress on a single port from anywhere.
    pub fn tcp_ingress(security_group_id: &str, port: u16) -> Self {
        Self {
            security_group_id: security_group_id.to_string(),
            direction: "ingress",
            ethertype: "IPv4",
            protocol: "tcp",
            port_range_min: port,
            port_range_max: port,
            remote_ip_prefix: "0.0.0.0/0",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeyPair {
    pub name: String,
    #[serde(default)]
    pub fingerprint: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(default)]
    pub port_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Volume {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct VolumeRequest {
    pub name: String,
    pub description: String,
    pub size: u32,
    #[serde(rename = "imageRef")]
    pub image_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerFault {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub fault: Option<ServerFault>,
}

/// Boot-from-volume server creation parameters.
#[derive(Clone, Debug)]
pub struct ServerRequest {
    pub name: String,
    pub flavor_id: String,
    pub network_id: String,
    pub security_group: String,
    pub key_name: String,
    pub volume_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub bytes: u64,
}

/// Result of a container HEAD. Both fields are `None` when the headers are
/// missing or do not parse.
#[derive(Clone, Debug, Default)]
pub struct ContainerDetail {
    pub object_count: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObjectInfo {
    pub name: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl ObjectInfo {
    /// Swift reports `last_modified` as a naive UTC timestamp with optional
    /// fractional seconds.
    pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_modified.as_deref()?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Streaming upload body with a known length.
pub struct ObjectBody {
    pub length: u64,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn volumes_tolerate_null_names() {
        let volume: Volume =
            serde_json::from_str(r#"{"id": "v1", "name": null, "status": "available"}"#)
                .expect("decodes");
        assert_eq!(volume.name, "");
        assert_eq!(volume.status, "available");
    }

    #[test]
    fn external_flag_uses_neutron_attribute_name() {
        let network: Network =
            serde_json::from_str(r#"{"id": "n1", "name": "internet", "router:external": true}"#)
                .expect("decodes");
        assert!(network.external);
    }

    #[test]
    fn swift_last_modified_parses_as_utc() {
        let object = ObjectInfo {
            name: "payload".to_string(),
            bytes: 0,
            last_modified: Some("2024-03-01T12:30:05.123450".to_string()),
        };
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).single().expect("valid");
        let parsed = object.last_modified_at().expect("parses");
        assert_eq!(parsed.timestamp(), expected.timestamp());

        let broken = ObjectInfo {
            last_modified: Some("yesterday".to_string()),
            ..object
        };
        assert!(broken.last_modified_at().is_none());
    }

    #[test]
    fn rule_request_serializes_single_port_ingress() {
        let rule = serde_json::to_value(SecurityRuleRequest::tcp_ingress("sg-1", 22))
            .expect("serializes");
        assert_eq!(rule["direction"], "ingress");
        assert_eq!(rule["port_range_min"], 22);
        assert_eq!(rule["port_range_max"], 22);
        assert_eq!(rule["remote_ip_prefix"], "0.0.0.0/0");
    }
}
