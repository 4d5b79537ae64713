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

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::cloudprobe::config::{
    CollectorConfig, ProbeConfig, DEFAULT_LISTEN_ADDR, DEFAULT_TAG_PREFIX,
};
use crate::cloudprobe::logger::{LogFormat, LogLevel};

/// Synthetic OpenStack probes exported as Prometheus metrics.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct CloudProbe {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve probe metrics over HTTP and run the garbage collector
    Serve(ServeArgs),

    /// Run both probes once and print the resulting metrics
    Probe(ProbeArgs),

    /// Run a single garbage collection sweep
    Sweep(SweepArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for LogLevel {
    fn from(value: LogLevelArg) -> Self {
        match value {
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Error => LogLevel::Error,
        }
    }
}

#[derive(Args)]
pub struct LoggingArgs {
    /// Log line encoding
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text, global = true)]
    pub log_format: LogFormatArg,

    /// Minimum level of emitted log lines
    #[arg(long, value_enum, default_value_t = LogLevelArg::Info, global = true)]
    pub log_level: LogLevelArg,
}

#[derive(Args)]
pub struct TagArgs {
    /// Prefix of every resource name the probes create and the collector owns
    #[arg(long = "tag", env = "CLOUDPROBE_TAG", default_value = DEFAULT_TAG_PREFIX)]
    pub tag_prefix: String,
}

/// Probe settings. Unset options keep the built-in defaults.
#[derive(Args)]
pub struct ProbeOptions {
    /// Overall deadline of one scrape (e.g. 59s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Pause between polling attempts (e.g. 1s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Name of the image to boot
    #[arg(long)]
    pub image: Option<String>,

    /// Name of the flavor to boot
    #[arg(long)]
    pub flavor: Option<String>,

    /// Name of the network the server attaches to
    #[arg(long)]
    pub network: Option<String>,

    /// Name of the network floating addresses are allocated from
    #[arg(long)]
    pub external_network: Option<String>,

    /// Size of the boot volume in GiB
    #[arg(long, value_name = "GIB")]
    pub volume_size: Option<u32>,

    /// User to log in as
    #[arg(long)]
    pub login_user: Option<String>,

    /// Port the login probe connects to
    #[arg(long)]
    pub login_port: Option<u16>,

    /// Command run after logging in
    #[arg(long)]
    pub login_command: Option<String>,

    /// Size of the object uploaded by the object store probe, in bytes
    #[arg(long, value_name = "BYTES")]
    pub payload_size: Option<u64>,
}

impl ProbeOptions {
    pub fn to_config(&self, tag_prefix: &str) -> ProbeConfig {
        let defaults = ProbeConfig::default();
        ProbeConfig {
            tag_prefix: tag_prefix.to_string(),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            image: self.image.clone().unwrap_or(defaults.image),
            flavor: self.flavor.clone().unwrap_or(defaults.flavor),
            private_network: self.network.clone().unwrap_or(defaults.private_network),
            external_network: self
                .external_network
                .clone()
                .unwrap_or(defaults.external_network),
            volume_size_gb: self.volume_size.unwrap_or(defaults.volume_size_gb),
            login_user: self.login_user.clone().unwrap_or(defaults.login_user),
            login_port: self.login_port.unwrap_or(defaults.login_port),
            login_command: self.login_command.clone().unwrap_or(defaults.login_command),
            payload_size: self.payload_size.unwrap_or(defaults.payload_size),
        }
    }
}

#[derive(Args)]
pub struct CollectorOptions {
    /// Pause between collector sweeps (e.g. 1m)
    #[arg(long = "gc-interval", value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Age after which tagged resources are deleted (e.g. 15m)
    #[arg(long = "gc-retention", value_parser = humantime::parse_duration)]
    pub retention: Option<Duration>,
}

impl CollectorOptions {
    pub fn to_config(&self, tag_prefix: &str) -> CollectorConfig {
        let defaults = CollectorConfig::default();
        CollectorConfig {
            tag_prefix: tag_prefix.to_string(),
            interval: self.interval.unwrap_or(defaults.interval),
            retention: self.retention.unwrap_or(defaults.retention),
        }
    }
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind the metrics server (e.g. 0.0.0.0:9539)
    #[arg(long, env = "CLOUDPROBE_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Do not run the garbage collector in this process
    #[arg(long)]
    pub no_gc: bool,

    #[command(flatten)]
    pub tag: TagArgs,

    #[command(flatten)]
    pub probe: ProbeOptions,

    #[command(flatten)]
    pub collector: CollectorOptions,
}

#[derive(Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub tag: TagArgs,

    #[command(flatten)]
    pub probe: ProbeOptions,
}

#[derive(Args)]
pub struct SweepArgs {
    #[command(flatten)]
    pub tag: TagArgs,

    #[command(flatten)]
    pub collector: CollectorOptions,
}
