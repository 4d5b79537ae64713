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

use std::env;
use std::fmt;
use std::time::Duration;

use crate::cloudprobe::util::error::{new_error, DynResult};

pub const DEFAULT_TAG_PREFIX: &str = "cloudprobe";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9539";
pub const DEFAULT_PAYLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// OpenStack credential parameters read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialVar {
    AuthUrl,
    Username,
    Password,
    UserDomainName,
    ProjectName,
    ProjectDomainName,
    RegionName,
    Interface,
}

impl CredentialVar {
    /// Returns the associated environment variable for the credential parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            CredentialVar::AuthUrl => "OS_AUTH_URL",
            CredentialVar::Username => "OS_USERNAME",
            CredentialVar::Password => "OS_PASSWORD",
            CredentialVar::UserDomainName => "OS_USER_DOMAIN_NAME",
            CredentialVar::ProjectName => "OS_PROJECT_NAME",
            CredentialVar::ProjectDomainName => "OS_PROJECT_DOMAIN_NAME",
            CredentialVar::RegionName => "OS_REGION_NAME",
            CredentialVar::Interface => "OS_INTERFACE",
        }
    }

    /// Value used when the variable is unset; `None` means the variable is
    /// required or genuinely optional.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            CredentialVar::UserDomainName | CredentialVar::ProjectDomainName => Some("Default"),
            CredentialVar::Interface => Some("public"),
            _ => None,
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> Option<String> {
        env::var(self.env_var())
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.default_value().map(str::to_string))
    }

    fn require(&self) -> DynResult<String> {
        self.get()
            .ok_or_else(|| new_error(format!("{} must be set", self.env_var())))
    }
}

#[derive(Clone)]
pub struct CloudCredentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain_name: String,
    pub project_name: String,
    pub project_domain_name: String,
    pub region_name: Option<String>,
    pub interface: String,
}

impl CloudCredentials {
    pub fn from_env() -> DynResult<Self> {
        Ok(Self {
            auth_url: CredentialVar::AuthUrl.require()?,
            username: CredentialVar::Username.require()?,
            password: CredentialVar::Password.require()?,
            user_domain_name: CredentialVar::UserDomainName.require()?,
            project_name: CredentialVar::ProjectName.require()?,
            project_domain_name: CredentialVar::ProjectDomainName.require()?,
            region_name: CredentialVar::RegionName.get(),
            interface: CredentialVar::Interface.require()?,
        })
    }
}

impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_domain_name", &self.user_domain_name)
            .field("project_name", &self.project_name)
            .field("project_domain_name", &self.project_domain_name)
            .field("region_name", &self.region_name)
            .field("interface", &self.interface)
            .finish()
    }
}

/// Settings shared by both probes for one exporter process.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub tag_prefix: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub image: String,
    pub flavor: String,
    pub private_network: String,
    pub external_network: String,
    pub volume_size_gb: u32,
    pub login_user: String,
    pub login_port: u16,
    pub login_command: String,
    pub payload_size: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
            request_timeout: Duration::from_secs(59),
            poll_interval: Duration::from_secs(1),
            image: "ubuntu-16.04-x86_64".to_string(),
            flavor: "t2.small".to_string(),
            private_network: "private".to_string(),
            external_network: "internet".to_string(),
            volume_size_gb: 10,
            login_user: "ubuntu".to_string(),
            login_port: 22,
            login_command: "/usr/bin/whoami".to_string(),
            payload_size: DEFAULT_PAYLOAD_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub tag_prefix: String,
    pub interval: Duration,
    pub retention: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(15 * 60),
        }
    }
}

impl CollectorConfig {
    /// A retention window that does not exceed the probe deadline lets the
    /// collector delete resources of a run that is still in flight.
    pub fn check_against(&self, probe: &ProbeConfig) -> Result<(), String> {
        if self.tag_prefix != probe.tag_prefix {
            return Err(format!(
                "collector tag prefix {:?} differs from probe tag prefix {:?}",
                self.tag_prefix, probe.tag_prefix
            ));
        }
        if self.retention <= probe.request_timeout {
            return Err(format!(
                "retention {} does not exceed request timeout {}",
                humantime::format_duration(self.retention),
                humantime::format_duration(probe.request_timeout)
            ));
        }
        Ok(())
    }
}
