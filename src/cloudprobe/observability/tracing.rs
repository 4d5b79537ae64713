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

//! Span identifiers for log correlation. Spans are backed by the `tracing`
//! crate, and a task-local [`TraceContext`] lets the logger attach `trace_id`,
//! `span_id` and the active probe run name to every line emitted inside a
//! probe task or a collector sweep.

use rand::{rngs::OsRng, RngCore};
use std::fmt::Write;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
    run: Option<Arc<str>>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Name of the probe run this span belongs to, inherited by child spans.
    pub fn run(&self) -> Option<&str> {
        self.run.as_deref()
    }
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber exactly once.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let _ = tracing::subscriber::set_global_default(Registry::default());
    });
}

pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.try_with(|ctx| ctx.clone()).ok()
}

/// Execute `fut` inside a new span. The trace id and run name are inherited
/// from the enclosing span when there is one.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let run = current_context().and_then(|ctx| ctx.run);
    enter(component, span_name.into(), run, fut).await
}

/// Like [`with_span`], additionally tagging every log line with `run`.
pub async fn with_run_span<T>(
    component: &'static str,
    run: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let run: Arc<str> = Arc::from(run.into());
    enter(component, run.to_string(), Some(run), fut).await
}

async fn enter<T>(
    component: &'static str,
    name: String,
    run: Option<Arc<str>>,
    fut: impl Future<Output = T>,
) -> T {
    let trace_id = current_context()
        .map(|ctx| ctx.trace_id)
        .unwrap_or_else(|| Arc::<str>::from(random_hex(16)));
    let span_id = Arc::<str>::from(random_hex(8));
    let span = tracing::info_span!(
        "cloudprobe",
        component = component,
        span = name.as_str(),
        trace_id = trace_id.as_ref(),
        span_id = span_id.as_ref(),
    );
    let context = TraceContext {
        trace_id,
        span_id,
        run,
    };

    ACTIVE_TRACE.scope(context, fut.instrument(span)).await
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}
