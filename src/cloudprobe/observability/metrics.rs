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

//! Prometheus collectors. Probe results are recorded into a registry that is
//! created fresh for every scrape so that stale timing samples never leak
//! between runs; collector metrics live in a process-wide registry that is
//! appended to every scrape response.

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::cloudprobe::openstack::ResourceKind;
use crate::cloudprobe::probe::{ProbeKind, ProbeOutcome};

const NAMESPACE: &str = "cloudprobe";

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static GC_DELETIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static GC_SWEEPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static GC_SWEEP_DURATION: OnceLock<Histogram> = OnceLock::new();
static GC_LAST_SWEEP: OnceLock<Gauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)
            .expect("failed to initialise cloudprobe metrics registry");
        #[cfg(target_os = "linux")]
        {
            let _ = registry.register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ));
        }
        registry
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register cloudprobe metric collector");
    collector
}

fn gc_deletions_total() -> &'static IntCounterVec {
    GC_DELETIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "deletions_total",
            "Garbage collector deletion attempts grouped by resource kind and result",
        )
        .subsystem("gc");
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("failed to build gc deletions counter");
        register_collector(counter)
    })
}

fn gc_sweeps_total() -> &'static IntCounterVec {
    GC_SWEEPS_TOTAL.get_or_init(|| {
        let opts = Opts::new("sweeps_total", "Garbage collector sweeps grouped by result")
            .subsystem("gc");
        let counter =
            IntCounterVec::new(opts, &["result"]).expect("failed to build gc sweeps counter");
        register_collector(counter)
    })
}

fn gc_sweep_duration() -> &'static Histogram {
    GC_SWEEP_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "sweep_duration_seconds",
            "Wall time spent in one garbage collector sweep",
        )
        .subsystem("gc")
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]);
        let histogram = Histogram::with_opts(opts).expect("failed to build gc sweep histogram");
        register_collector(histogram)
    })
}

fn gc_last_sweep() -> &'static Gauge {
    GC_LAST_SWEEP.get_or_init(|| {
        let opts = Opts::new(
            "last_sweep_timestamp_seconds",
            "Unix time at which the last garbage collector sweep finished",
        )
        .subsystem("gc");
        let gauge = Gauge::with_opts(opts).expect("failed to build gc last sweep gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GcDeletionResult {
    Deleted,
    Failed,
    InUse,
}

impl GcDeletionResult {
    fn as_label(self) -> &'static str {
        match self {
            GcDeletionResult::Deleted => "deleted",
            GcDeletionResult::Failed => "failed",
            GcDeletionResult::InUse => "in_use",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GcSweepResult {
    Completed,
    Partial,
    AuthFailed,
}

impl GcSweepResult {
    fn as_label(self) -> &'static str {
        match self {
            GcSweepResult::Completed => "completed",
            GcSweepResult::Partial => "partial",
            GcSweepResult::AuthFailed => "auth_failed",
        }
    }
}

pub fn record_gc_deletion(kind: ResourceKind, result: GcDeletionResult) {
    gc_deletions_total()
        .with_label_values(&[kind.as_label(), result.as_label()])
        .inc();
}

pub fn record_gc_sweep(result: GcSweepResult, elapsed: Duration, finished_at: f64) {
    gc_sweeps_total()
        .with_label_values(&[result.as_label()])
        .inc();
    gc_sweep_duration().observe(elapsed.as_secs_f64());
    gc_last_sweep().set(finished_at);
}

/// Success and timing gauges for one probe, registered into a per-scrape
/// registry under `cloudprobe_<probe>`.
#[derive(Clone)]
pub struct ProbeMetrics {
    success: GaugeVec,
    timing: GaugeVec,
}

impl ProbeMetrics {
    pub fn register(registry: &Registry, kind: ProbeKind) -> prometheus::Result<Self> {
        let namespace = format!("{NAMESPACE}_{}", kind.as_label());
        let success = GaugeVec::new(
            Opts::new("success", kind.success_help()).namespace(namespace.clone()),
            &["error"],
        )?;
        let timing = GaugeVec::new(
            Opts::new("timing", kind.timing_help()).namespace(namespace),
            &["step"],
        )?;
        registry.register(Box::new(success.clone()))?;
        registry.register(Box::new(timing.clone()))?;
        Ok(Self { success, timing })
    }

    pub fn timing(&self) -> GaugeVec {
        self.timing.clone()
    }

    pub fn publish(&self, outcome: &ProbeOutcome) {
        let value = if outcome.is_success() { 1.0 } else { 0.0 };
        let error = outcome.as_label();
        self.success
            .with_label_values(&[error.as_str()])
            .set(value);
    }
}

/// Body served when a scrape could not be rendered: both probes report
/// failure with `cause` as the error label. Empty if even that fails.
pub fn render_scrape_failure(cause: &str) -> Vec<u8> {
    let registry = Registry::new();
    for kind in [ProbeKind::Compute, ProbeKind::Storage] {
        if let Ok(metrics) = ProbeMetrics::register(&registry, kind) {
            metrics.success.with_label_values(&[cause]).set(0.0);
        }
    }
    let mut buffer = Vec::new();
    if encode(&registry, &mut buffer).is_err() {
        buffer.clear();
    }
    buffer
}

/// Registers `cloudprobe_build_info{version}` into a per-scrape registry.
pub fn register_build_info(registry: &Registry) -> prometheus::Result<()> {
    let gauge = IntGaugeVec::new(
        Opts::new("build_info", "Constant 1, labelled with the running version")
            .namespace(NAMESPACE),
        &["version"],
    )?;
    gauge
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1);
    registry.register(Box::new(gauge))
}

pub fn encode(
    registry: &Registry,
    buffer: &mut Vec<u8>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    TextEncoder::new()
        .encode(&registry.gather(), buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)
}

/// Appends the process-wide collectors to `buffer`.
pub fn gather_into(buffer: &mut Vec<u8>) -> Result<(), Box<dyn Error + Send + Sync>> {
    encode(registry(), buffer)
}

pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let mut buffer = Vec::new();
    gather_into(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprobe::probe::ProbeFailure;

    #[test]
    fn gc_deletions_are_labelled_by_kind_and_result() {
        let counter = gc_deletions_total().with_label_values(&["keypair", "in_use"]);
        let before = counter.get();

        record_gc_deletion(ResourceKind::Keypair, GcDeletionResult::InUse);
        record_gc_deletion(ResourceKind::Server, GcDeletionResult::Deleted);

        assert_eq!(counter.get(), before + 1);
        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(text.contains("cloudprobe_gc_deletions_total"));
        assert!(text.contains("kind=\"server\""));
        assert!(text.contains("result=\"deleted\""));
    }

    #[test]
    fn sweeps_update_duration_and_timestamp() {
        let histogram = gc_sweep_duration();
        let before = histogram.get_sample_count();

        record_gc_sweep(GcSweepResult::Partial, Duration::from_millis(1500), 1_700_000_000.0);

        assert_eq!(histogram.get_sample_count(), before + 1);
        assert_eq!(gc_last_sweep().get(), 1_700_000_000.0);
        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(text.contains("cloudprobe_gc_sweeps_total{result=\"partial\"}"));
    }

    #[test]
    fn probe_metrics_live_in_the_scrape_registry() {
        let registry = Registry::new();
        let metrics = ProbeMetrics::register(&registry, ProbeKind::Storage).expect("register");
        metrics.timing().with_label_values(&["start"]).set(10.0);
        metrics.publish(&ProbeOutcome::Failure(ProbeFailure::RequestTimeout));
        register_build_info(&registry).expect("build info");

        let mut buffer = Vec::new();
        encode(&registry, &mut buffer).expect("encode");
        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.contains("cloudprobe_object_store_timing{step=\"start\"} 10"));
        assert!(text.contains(
            "cloudprobe_object_store_success{error=\"request timeout reached\"} 0"
        ));
        assert!(text.contains("cloudprobe_build_info{version="));
    }

    #[test]
    fn failed_scrapes_render_both_probes_as_failed() {
        let text = String::from_utf8(render_scrape_failure("encoder broke")).expect("utf8");
        assert!(text.contains("cloudprobe_spawn_success{error=\"encoder broke\"} 0"));
        assert!(text.contains("cloudprobe_object_store_success{error=\"encoder broke\"} 0"));
    }
}
