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

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Shared time budget of one scrape. Cloning is cheap and every clone observes
/// the same expiry. The deadline never aborts work by itself: callers check it
/// between steps and race their sleeps against it.
#[derive(Clone, Debug)]
pub struct Deadline {
    token: CancellationToken,
    expires_at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            expires_at: Instant::now() + timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.expires_at
    }

    /// Expire immediately, e.g. on shutdown.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn remaining(&self) -> Duration {
        if self.token.is_cancelled() {
            return Duration::ZERO;
        }
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Resolves once the deadline has expired.
    pub async fn expired(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = sleep_until(self.expires_at) => {}
        }
    }

    /// Sleeps for `interval` unless the deadline fires first. Returns `false`
    /// when the deadline has expired.
    pub async fn pause(&self, interval: Duration) -> bool {
        tokio::select! {
            _ = self.expired() => false,
            _ = sleep(interval) => !self.is_expired(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_timeout() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::from_secs(5));

        assert!(deadline.pause(Duration::from_secs(2)).await);
        assert!(!deadline.pause(Duration::from_secs(10)).await);
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_shared_between_clones() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let clone = deadline.clone();
        let waiter = tokio::spawn(async move { clone.expired().await });

        deadline.cancel();
        waiter.await.expect("waiter joins");
        assert!(deadline.is_expired());
    }
}
