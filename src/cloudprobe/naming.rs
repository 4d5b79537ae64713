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

//! Run names tie every cloud resource back to the probe run that created it.
//!
//! A run name has the shape `<prefix>-<suffix>-<unix seconds>`. The suffix is
//! random so overlapping runs never collide, and the timestamp lets the
//! garbage collector age a resource without any external bookkeeping.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::cloudprobe::logger::log_warn;

const SUFFIX_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunName {
    prefix: String,
    suffix: String,
    created: i64,
}

impl RunName {
    pub fn generate(prefix: &str) -> Self {
        Self::generate_at(prefix, Utc::now())
    }

    pub fn generate_at(prefix: &str, now: DateTime<Utc>) -> Self {
        let suffix = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect();
        RunName {
            prefix: prefix.to_string(),
            suffix,
            created: now.timestamp(),
        }
    }

    /// Decodes `name` if it was produced for `prefix`. The prefix itself may
    /// contain hyphens; the suffix and timestamp never do.
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
        let (suffix, timestamp) = rest.rsplit_once('-')?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let created = timestamp.parse::<i64>().ok()?;
        Some(RunName {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            created,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Creation time in unix seconds.
    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.created, 0).single()
    }

    /// True when strictly more than `retention` has elapsed since creation.
    pub fn is_expired(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        now.timestamp().saturating_sub(self.created) > retention
    }
}

impl fmt::Display for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.prefix, self.suffix, self.created)
    }
}

/// How the collector decides a resource's age.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgePolicy {
    /// Creation time is the timestamp embedded in the run name.
    NameEmbedded,
    /// Creation or modification time reported by the platform.
    PlatformTimestamp,
}

pub fn new_run_name(prefix: &str) -> String {
    RunName::generate(prefix).to_string()
}

/// True when `name` decodes as a run name for `prefix`.
pub fn is_owned(name: &str, prefix: &str) -> bool {
    RunName::parse(name, prefix).is_some()
}

/// True only for well formed run names of `prefix` older than `retention`.
/// Names that carry the prefix but do not decode are logged and kept.
pub fn is_owned_and_expired(
    name: &str,
    prefix: &str,
    retention: Duration,
    now: DateTime<Utc>,
) -> bool {
    let tagged = name
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('-'));
    if !tagged {
        return false;
    }
    match RunName::parse(name, prefix) {
        Some(run) => run.is_expired(retention, now),
        None => {
            log_warn(
                "naming",
                "Ignoring tagged resource with malformed name",
                &[("name", name)],
            );
            false
        }
    }
}

/// Platform timestamp variant of [`is_owned_and_expired`]. A missing
/// timestamp never expires.
pub fn is_timestamp_expired(
    timestamp: Option<DateTime<Utc>>,
    retention: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(timestamp) = timestamp else {
        return false;
    };
    match chrono::Duration::from_std(retention) {
        Ok(retention) => now.signed_duration_since(timestamp) > retention,
        Err(_) => false,
    }
}
