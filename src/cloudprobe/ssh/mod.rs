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

//! Remote-login collaborator used to prove a freshly booted server accepts
//! SSH with the key pair injected at boot.

pub mod client;
pub mod keys;

use std::net::SocketAddr;

use async_trait::async_trait;

pub use keys::{ClientKey, HostKey};

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("connection to {address} failed: {message}")]
    Dial { address: SocketAddr, message: String },
    #[error("host key presented by {0} is not in the trusted set")]
    UntrustedHostKey(SocketAddr),
    #[error("authentication as {0} rejected")]
    Rejected(String),
    #[error("remote command failed: {0}")]
    Command(String),
    #[error("invalid key material: {0}")]
    Key(String),
}

#[derive(Clone, Debug)]
pub struct LoginTarget {
    pub address: SocketAddr,
    pub user: String,
}

#[async_trait]
pub trait RemoteLogin: Send + Sync {
    /// Opens an authenticated session. When `trusted` is non-empty the server
    /// must present one of those host keys.
    async fn dial(
        &self,
        target: &LoginTarget,
        key: &ClientKey,
        trusted: &[HostKey],
    ) -> Result<Box<dyn RemoteConnection>, LoginError>;
}

#[async_trait]
pub trait RemoteConnection: Send {
    /// Runs `command` and returns its trimmed standard output. A non-zero exit
    /// status is an error.
    async fn run(&mut self, command: &str) -> Result<String, LoginError>;

    async fn close(self: Box<Self>);
}
