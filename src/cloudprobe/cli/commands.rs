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

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cloudprobe::config::CloudCredentials;
use crate::cloudprobe::coordinator::ProbeCoordinator;
use crate::cloudprobe::gc::GarbageCollector;
use crate::cloudprobe::logger::{self, log_info, log_warn};
use crate::cloudprobe::observability::tracing;
use crate::cloudprobe::openstack::auth::KeystoneProvider;
use crate::cloudprobe::openstack::CloudProvider;
use crate::cloudprobe::server;
use crate::cloudprobe::ssh::client::RusshLogin;
use crate::cloudprobe::ssh::RemoteLogin;
use crate::cloudprobe::util::error::{new_error, with_context, DynResult};

use super::args::{CloudProbe, Commands, ProbeArgs, ServeArgs, SweepArgs};

pub async fn run(cli: &CloudProbe) -> DynResult<()> {
    logger::set_log_format(cli.logging.log_format.into());
    logger::set_min_level(cli.logging.log_level.into());
    tracing::init();

    match &cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Probe(args) => probe_once(args).await,
        Commands::Sweep(args) => sweep_once(args).await,
    }
}

async fn serve(args: &ServeArgs) -> DynResult<()> {
    let addr: SocketAddr = args.listen.parse().map_err(|e| {
        with_context(e, format!("Invalid listen address '{}'", args.listen))
    })?;
    let probe = args.probe.to_config(&args.tag.tag_prefix);
    let collector = args.collector.to_config(&args.tag.tag_prefix);
    if let Err(problem) = collector.check_against(&probe) {
        log_warn(
            "cli",
            "Collector settings may reclaim resources of running probes",
            &[("problem", problem.as_str())],
        );
    }

    let provider = keystone(probe.request_timeout)?;
    let login: Arc<dyn RemoteLogin> = Arc::new(RusshLogin::default());
    let coordinator = Arc::new(ProbeCoordinator::new(provider.clone(), login, probe));

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let collector_task = if args.no_gc {
        log_info("cli", "Garbage collector disabled", &[]);
        None
    } else {
        let gc = Arc::new(GarbageCollector::new(provider, Arc::new(collector)));
        Some(tokio::spawn(gc.run(shutdown.clone())))
    };

    let result = server::serve(addr, coordinator, shutdown.clone()).await;
    shutdown.cancel();
    if let Some(task) = collector_task {
        if let Err(err) = task.await {
            log_warn(
                "cli",
                "Garbage collector task ended abnormally",
                &[("error", &err.to_string())],
            );
        }
    }
    result
}

/// Runs one scrape and writes the exposition to stdout. Probe failures are
/// part of the output, not an error of the command.
async fn probe_once(args: &ProbeArgs) -> DynResult<()> {
    let probe = args.probe.to_config(&args.tag.tag_prefix);
    let provider = keystone(probe.request_timeout)?;
    let login: Arc<dyn RemoteLogin> = Arc::new(RusshLogin::default());
    let coordinator = ProbeCoordinator::new(provider, login, probe);

    let buffer = coordinator.scrape().await?;
    let mut stdout = io::stdout().lock();
    stdout
        .write_all(&buffer)
        .and_then(|()| stdout.flush())
        .map_err(|e| with_context(e, "Failed to write metrics"))?;
    Ok(())
}

async fn sweep_once(args: &SweepArgs) -> DynResult<()> {
    let collector = args.collector.to_config(&args.tag.tag_prefix);
    let provider = keystone(Duration::from_secs(60))?;
    let gc = GarbageCollector::new(provider, Arc::new(collector));

    let report = gc
        .sweep(Utc::now())
        .await
        .map_err(|e| with_context(e, "Sweep aborted"))?;
    let deleted = report.total_deleted().to_string();
    let failed = report.total_failed().to_string();
    log_info(
        "cli",
        "Sweep finished",
        &[("deleted", deleted.as_str()), ("failed", failed.as_str())],
    );
    if report.is_complete() {
        Ok(())
    } else {
        Err(new_error(format!("{failed} resources could not be reclaimed")))
    }
}

fn keystone(request_timeout: Duration) -> DynResult<Arc<dyn CloudProvider>> {
    let credentials = CloudCredentials::from_env()?;
    let provider = KeystoneProvider::new(credentials, request_timeout)
        .map_err(|e| with_context(e, "Failed to prepare OpenStack client"))?;
    Ok(Arc::new(provider))
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        log_info("cli", "Shutdown requested", &[]);
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
