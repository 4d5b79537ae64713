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

use chrono::Utc;
use prometheus::GaugeVec;

use super::{Deadline, ProbeFailure, ProbeResult, Stage};
use crate::cloudprobe::logger::log_debug;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Checkpoint<S> {
    pub stage: S,
    /// Wall clock unix seconds.
    pub timestamp: f64,
}

/// Publishes one `timing{step}` sample per completed stage and doubles as the
/// deadline gate between stages.
pub struct StepRecorder<S: Stage> {
    component: &'static str,
    timing: GaugeVec,
    deadline: Deadline,
    checkpoints: Vec<Checkpoint<S>>,
}

impl<S: Stage> StepRecorder<S> {
    pub fn new(component: &'static str, timing: GaugeVec, deadline: Deadline) -> Self {
        Self {
            component,
            timing,
            deadline,
            checkpoints: Vec::new(),
        }
    }

    /// Marks `stage` complete. Fails with "timeout after <stage>" when the
    /// deadline has already expired, after the checkpoint is recorded.
    pub fn record(&mut self, stage: S) -> ProbeResult<()> {
        self.record_at(stage, unix_now())
    }

    fn record_at(&mut self, stage: S, now: f64) -> ProbeResult<()> {
        // Wall clock steps backwards are clamped so the series stays ordered.
        let timestamp = match self.checkpoints.last() {
            Some(last) if now < last.timestamp => last.timestamp,
            _ => now,
        };
        self.timing
            .with_label_values(&[stage.as_label()])
            .set(timestamp);
        self.checkpoints.push(Checkpoint { stage, timestamp });
        log_debug(
            self.component,
            "Stage completed",
            &[("step", stage.as_label())],
        );

        if self.deadline.is_expired() {
            return Err(ProbeFailure::TimeoutAfter(stage.as_label()));
        }
        Ok(())
    }

    pub fn checkpoints(&self) -> &[Checkpoint<S>] {
        &self.checkpoints
    }

    pub fn stages(&self) -> Vec<S> {
        self.checkpoints.iter().map(|checkpoint| checkpoint.stage).collect()
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
