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

use reqwest::StatusCode;

pub type CloudResult<T> = Result<T, CloudError>;

const MESSAGE_MAX_LEN: usize = 240;
const IN_USE_MARKERS: [&str; 4] = ["InUse", "in use", "in-use", "still attached"];

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("{service} returned {status}: {message}")]
    Status {
        service: &'static str,
        status: StatusCode,
        message: String,
    },
    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("cannot decode {service} response: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
    /// Keystone refused to issue a token.
    #[error("{0}")]
    Auth(String),
    #[error("no {0} endpoint in the service catalog")]
    MissingEndpoint(&'static str),
}

impl CloudError {
    pub fn status(service: &'static str, status: StatusCode, body: &str) -> Self {
        CloudError::Status {
            service,
            status,
            message: summarize_body(body),
        }
    }

    pub fn decode(service: &'static str, message: impl ToString) -> Self {
        CloudError::Decode {
            service,
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    /// Failures caused by a dependent resource, e.g. a security group still
    /// bound to a port or a volume still attached to a server. Decided on the
    /// error text; other conflicts (quota, state) are not in use.
    pub fn is_in_use(&self) -> bool {
        match self {
            CloudError::Status { message, .. } => IN_USE_MARKERS
                .iter()
                .any(|marker| message.contains(marker)),
            _ => false,
        }
    }

    /// Failures worth retrying on the next poll or sweep.
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            CloudError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }
}

/// OpenStack error bodies are JSON documents with the human readable text in
/// a `message` field one level down; fall back to the raw text otherwise.
fn summarize_body(body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| find_message(&value))
        .unwrap_or_else(|| body.trim().to_string());
    let mut message = message.replace('\n', " ");
    if message.len() > MESSAGE_MAX_LEN {
        let mut cut = MESSAGE_MAX_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

fn find_message(value: &serde_json::Value) -> Option<String> {
    let object = value.as_object()?;
    if let Some(message) = object.get("message").and_then(|m| m.as_str()) {
        let kind = object.get("type").and_then(|t| t.as_str());
        return Some(match kind {
            Some(kind) => format!("{kind}: {message}"),
            None => message.to_string(),
        });
    }
    if let Some(message) = object.get("NeutronError").and_then(find_message) {
        return Some(message);
    }
    object.values().find_map(find_message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutron_in_use_errors_are_classified() {
        let body = r#"{"NeutronError": {"type": "SecurityGroupInUse", "message": "Security Group 1 in use.", "detail": ""}}"#;
        let error = CloudError::status("network", StatusCode::CONFLICT, body);
        assert!(error.is_in_use());
        assert!(!error.is_not_found());
        assert!(error.to_string().contains("SecurityGroupInUse: Security Group 1 in use."));
    }

    #[test]
    fn cinder_attached_volume_is_in_use() {
        let body = r#"{"badRequest": {"code": 400, "message": "Volume status must be available or error, but current status is: in-use"}}"#;
        let error = CloudError::status("volume", StatusCode::BAD_REQUEST, body);
        assert!(error.is_in_use());
        assert!(error.to_string().contains("current status is: in-use"));

        let attached =
            CloudError::status("volume", StatusCode::BAD_REQUEST, "volume still attached");
        assert!(attached.is_in_use());
    }

    #[test]
    fn unrelated_conflicts_are_not_in_use() {
        let quota = r#"{"NeutronError": {"type": "QuotaExceeded", "message": "quota"}}"#;
        let error = CloudError::status("network", StatusCode::CONFLICT, quota);
        assert!(!error.is_in_use());

        let generic = CloudError::status(
            "object-store",
            StatusCode::CONFLICT,
            "There was a conflict when trying to complete your request.",
        );
        assert!(!generic.is_in_use());
    }

    #[test]
    fn not_found_and_transient_statuses() {
        let missing = CloudError::status("compute", StatusCode::NOT_FOUND, "");
        assert!(missing.is_not_found());
        assert!(!missing.is_transient());

        let busy = CloudError::status("compute", StatusCode::SERVICE_UNAVAILABLE, "<html>");
        assert!(busy.is_transient());
        assert!(!busy.is_in_use());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let error = CloudError::status("image", StatusCode::BAD_GATEWAY, &"x".repeat(1000));
        match error {
            CloudError::Status { message, .. } => assert_eq!(message.len(), MESSAGE_MAX_LEN),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
