/*
 * Copyright 2025 Michael Krolikowski
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

mod container;
mod engine;
mod error;
mod filter;
mod lock;
mod log;
mod metrics;
mod notify;
mod registry;
mod report;
mod schedule;
mod serve;
mod settings;
mod update;

use std::sync::Arc;

use ::log::{error, info, warn};
use anyhow::Result;
use clap::Parser;
use engine::DockerEngine;
use error::SessionError;
use log::LogError;
use notify::{LogNotifier, Notifier};
use registry::OciProbe;
use schedule::Scheduler;
use serve::Serve;
use settings::{Cli, Settings};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use update::Supervisor;

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

/// First signal shuts down gracefully, a second one exits immediately.
async fn watch_signals(shutdown: CancellationToken) {
    if shutdown_signal().await.log_error().is_none() {
        return;
    }
    info!("Shutting down, waiting for a running update to finish");
    shutdown.cancel();
    if shutdown_signal().await.log_error().is_some() {
        warn!("Forced shutdown");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    log::init(cli.log_level())?;
    let settings = Arc::new(Settings::from_cli(cli)?);

    let engine = DockerEngine::connect()
        .await
        .map_err(|e| SessionError::EngineUnreachable(e.to_string()))?;
    let probe = OciProbe::new(settings.credentials.clone());
    let notifiers: Vec<Box<dyn Notifier>> =
        vec![Box::new(LogNotifier::new(settings.split_by_container))];
    let shutdown = CancellationToken::new();
    let supervisor = Arc::new(Supervisor::new(
        settings.clone(),
        Arc::new(engine),
        Arc::new(probe),
        notifiers,
        shutdown.clone(),
    ));
    tokio::spawn(watch_signals(shutdown.clone()));

    if settings.run_once {
        info!("Running a one time update");
        let report = supervisor.run_once().await;
        supervisor.close().await;
        return match report.failure() {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(()),
        };
    }

    {
        let exit = supervisor.exit_requested();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            exit.cancelled().await;
            info!("Replacement supervisor started, shutting down");
            shutdown.cancel();
        });
    }

    let mut tasks = JoinSet::new();
    if settings.http.update || settings.http.metrics {
        let serve = Serve::new(supervisor.clone(), shutdown.clone());
        tasks.spawn(async move { serve.serve().await });
    }
    if settings.periodic_polls() {
        let scheduler = Scheduler::new(
            settings.schedule.clone(),
            supervisor.clone(),
            shutdown.clone(),
            settings.update_on_start,
        );
        tasks.spawn(async move {
            scheduler.run().await;
            Ok(())
        });
    } else if settings.update_on_start {
        let supervisor = supervisor.clone();
        tasks.spawn(async move {
            if supervisor.try_update().await.is_err() {
                info!("Skipping update on start, an update is already running");
            }
            Ok(())
        });
    }

    info!("Started");
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined? {
            error!("Error: {e}");
            shutdown.cancel();
            result = Err(e);
        }
    }
    supervisor.close().await;
    result
}
