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

//! russh based [`RemoteLogin`] with host key pinning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use super::{ClientKey, HostKey, LoginError, LoginTarget, RemoteConnection, RemoteLogin};
use crate::cloudprobe::logger::log_debug;

pub struct RusshLogin {
    connect_timeout: Duration,
    inactivity_timeout: Duration,
}

impl RusshLogin {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            inactivity_timeout: connect_timeout.saturating_mul(2),
        }
    }
}

impl Default for RusshLogin {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

struct PinnedHostKeys {
    trusted: Vec<HostKey>,
    rejected: Arc<AtomicBool>,
}

/// An empty trusted set accepts any key; the console did not yield one.
fn is_trusted(trusted: &[HostKey], presented: &[u8]) -> bool {
    trusted.is_empty() || trusted.iter().any(|key| key.matches(presented))
}

#[async_trait]
impl client::Handler for PinnedHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = is_trusted(&self.trusted, &server_public_key.public_key_bytes());
        if !accepted {
            self.rejected.store(true, Ordering::Relaxed);
        }
        Ok(accepted)
    }
}

#[async_trait]
impl RemoteLogin for RusshLogin {
    async fn dial(
        &self,
        target: &LoginTarget,
        key: &ClientKey,
        trusted: &[HostKey],
    ) -> Result<Box<dyn RemoteConnection>, LoginError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.inactivity_timeout),
            ..Default::default()
        });
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = PinnedHostKeys {
            trusted: trusted.to_vec(),
            rejected: rejected.clone(),
        };

        let connect = client::connect(config, target.address, handler);
        let mut handle = match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => {
                return Err(LoginError::Dial {
                    address: target.address,
                    message: "timed out".to_string(),
                })
            }
            Ok(Err(_)) if rejected.load(Ordering::Relaxed) => {
                return Err(LoginError::UntrustedHostKey(target.address))
            }
            Ok(Err(err)) => {
                return Err(LoginError::Dial {
                    address: target.address,
                    message: err.to_string(),
                })
            }
            Ok(Ok(handle)) => handle,
        };

        let keypair = russh_keys::decode_secret_key(key.private_pem(), None)
            .map_err(|err| LoginError::Key(err.to_string()))?;
        let accepted = handle
            .authenticate_publickey(target.user.clone(), Arc::new(keypair))
            .await
            .map_err(|err| LoginError::Dial {
                address: target.address,
                message: err.to_string(),
            })?;
        if !accepted {
            return Err(LoginError::Rejected(target.user.clone()));
        }

        log_debug(
            "ssh",
            "Authenticated remote session",
            &[
                ("address", &target.address.to_string()),
                ("user", &target.user),
            ],
        );
        Ok(Box::new(RusshConnection { handle }))
    }
}

struct RusshConnection {
    handle: Handle<PinnedHostKeys>,
}

#[async_trait]
impl RemoteConnection for RusshConnection {
    async fn run(&mut self, command: &str) -> Result<String, LoginError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| LoginError::Command(err.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|err| LoginError::Command(err.to_string()))?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        match exit_status {
            Some(0) => Ok(String::from_utf8_lossy(&output).trim().to_string()),
            Some(code) => Err(LoginError::Command(format!(
                "{command} exited with status {code}"
            ))),
            None => Err(LoginError::Command(format!(
                "{command} finished without an exit status"
            ))),
        }
    }

    async fn close(self: Box<Self>) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
