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

//! Structured line logger shared by the probes, the collector and the HTTP
//! surface. Every line carries a fixed prefix (`ts`, `level`, `service`,
//! `component`, `pid`, `msg`) followed by trace identifiers, the active probe
//! run (if any) and caller supplied metadata.

use crate::cloudprobe::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
#[cfg(not(test))]
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "cloudprobe";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Drops lines below `level`. Probes log every polling attempt at debug, so
/// long running deployments usually raise this to `Info`.
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn enabled(self) -> bool {
        self as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
    }

    #[cfg_attr(test, allow(dead_code))]
    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',')
        });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

/// Ordered key/value pairs for one log line. Empty keys are skipped and later
/// duplicates of the fixed prefix keys are ignored so callers cannot spoof them.
struct LogRecord {
    fields: Vec<(String, String)>,
}

impl LogRecord {
    const RESERVED: [&'static str; 6] = ["ts", "level", "service", "component", "pid", "msg"];

    fn new(level: LogLevel, component: &str, message: &str) -> Self {
        let fields = vec![
            (
                "ts".to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            ("level".to_string(), level.as_str().to_string()),
            ("service".to_string(), SERVICE_NAME.to_string()),
            ("component".to_string(), component.to_string()),
            ("pid".to_string(), std::process::id().to_string()),
            ("msg".to_string(), message.to_string()),
        ];
        Self { fields }
    }

    fn push(&mut self, key: &str, value: &str) {
        if key.is_empty() || Self::RESERVED.contains(&key) {
            return;
        }
        self.fields.push((key.to_string(), value.to_string()));
    }

    fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => {
                let mut line = String::new();
                for (key, value) in &self.fields {
                    if !line.is_empty() {
                        line.push(' ');
                    }
                    line.push_str(key);
                    line.push('=');
                    line.push_str(&encode_field_value(value));
                }
                line
            }
            LogFormat::Json => {
                let mut payload = serde_json::Map::new();
                for (key, value) in &self.fields {
                    payload.insert(key.clone(), Value::String(value.clone()));
                }
                Value::Object(payload).to_string()
            }
        }
    }
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    if !level.enabled() {
        return;
    }

    let mut record = LogRecord::new(level, component, message);
    if let Some(ctx) = tracing::current_context() {
        record.push("trace_id", ctx.trace_id());
        record.push("span_id", ctx.span_id());
        if let Some(run) = ctx.run() {
            record.push("run", run);
        }
    }
    for (key, value) in metadata {
        record.push(key, value);
    }

    write_line(level, &record.render(current_log_format()));
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let write_result = if level.is_stderr() {
        writeln!(io::stderr().lock(), "{line}")
    } else {
        writeln!(io::stdout().lock(), "{line}")
    };

    if let Err(error) = write_result {
        let _ = writeln!(
            io::stderr().lock(),
            "cloudprobe: failed to write log line: {error} (original: {line})"
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    let mut guard = test_log_store().lock().unwrap();
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

#[cfg(test)]
pub(crate) fn take_test_logs() -> Vec<(LogLevel, String)> {
    let mut guard = test_log_store().lock().unwrap();
    guard.drain(..).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprobe::observability::tracing;
    use serial_test::serial;

    #[tokio::test]
    #[serial(logger)]
    async fn text_lines_carry_trace_and_run() {
        set_log_format(LogFormat::Text);
        take_test_logs();
        tracing::with_run_span("probe.compute", "cloudprobe-ab12-1700000000", async {
            log_info("compute", "created security group", &[("id", "sg 1")]);
        })
        .await;

        let logs = take_test_logs();
        let (level, line) = logs
            .iter()
            .find(|(_, line)| line.contains("created security group"))
            .expect("log line recorded");
        assert_eq!(*level, LogLevel::Info);
        assert!(line.contains("trace_id=") && line.contains("span_id="), "{line}");
        assert!(line.contains("run=cloudprobe-ab12-1700000000"), "{line}");
        assert!(line.contains("id=\"sg 1\""), "{line}");
    }

    #[tokio::test]
    #[serial(logger)]
    async fn json_lines_refuse_reserved_overrides() {
        set_log_format(LogFormat::Json);
        take_test_logs();
        log_warn("gc", "sweep failed", &[("component", "spoofed"), ("kind", "server")]);
        set_log_format(LogFormat::Text);

        let logs = take_test_logs();
        let payload: Value = serde_json::from_str(&logs[0].1).expect("valid json log");
        assert_eq!(payload.get("component").and_then(Value::as_str), Some("gc"));
        assert_eq!(payload.get("kind").and_then(Value::as_str), Some("server"));
        assert_eq!(payload.get("level").and_then(Value::as_str), Some("WARN"));
        assert!(payload.get("run").is_none());
    }

    #[test]
    fn quoting_covers_empty_and_separator_values() {
        assert_eq!(encode_field_value("plain"), "plain");
        assert_eq!(encode_field_value(""), "\"\"");
        assert_eq!(encode_field_value("a=b"), "\"a=b\"");
        assert_eq!(encode_field_value("line\nbreak"), "\"line\\nbreak\"");
    }
}
