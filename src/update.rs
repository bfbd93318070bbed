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

mod cleanup;
mod discovery;
mod executor;
mod hooks;
mod instances;
mod self_update;
mod sorter;
mod staleness;
#[cfg(test)]
pub mod testing;

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::{
    container::{Container, Hook, Policy},
    engine::{Engine, EngineError, EngineResult, guarded},
    error::{ContainerError, ErrorKind, SessionError},
    filter::Filter,
    lock::{UpdateGuard, UpdateLock},
    log::LogError,
    metrics::Metrics,
    notify::Notifier,
    registry::RegistryProbe,
    report::{Entry, Outcome, Report, ReportBuilder},
    settings::Settings,
};
use executor::Target;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("another update is already running")]
pub struct Busy;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("timed out waiting for the running update to finish")]
pub struct QueueTimeout;

/// Everything a session needs to talk to the outside world.
#[derive(Clone)]
pub struct Context {
    pub settings: Arc<Settings>,
    pub engine: Arc<dyn Engine>,
    pub probe: Arc<dyn RegistryProbe>,
    pub token: CancellationToken,
}

impl Context {
    /// Engine call that gives up on cancellation or after the engine timeout.
    pub async fn call<T, F>(&self, call: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        guarded(&self.token, self.settings.engine_timeout, call).await
    }

    /// Engine call that must finish even when the session is cancelled.
    pub async fn complete<T, F>(&self, extra: Duration, call: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let limit = self.settings.engine_timeout + extra;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(EngineError::Timeout(limit)))
    }

    /// Engine call bounded only by cancellation, for commands with their own timeout.
    pub async fn interruptible<T, F>(&self, call: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        tokio::select! {
            () = self.token.cancelled() => Err(EngineError::Cancelled),
            result = call => result,
        }
    }

    /// Engine call that may outlive cancellation by at most the engine timeout.
    pub async fn wind_down<T, F>(&self, call: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        tokio::pin!(call);
        tokio::select! {
            result = &mut call => result,
            () = self.token.cancelled() => {
                let grace = self.settings.engine_timeout;
                tokio::time::timeout(grace, call)
                    .await
                    .unwrap_or(Err(EngineError::Timeout(grace)))
            }
        }
    }

    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Records, announces and hands over after a session.
#[derive(Clone)]
struct Reporter {
    context: Context,
    metrics: Metrics,
    notifiers: Arc<Vec<Box<dyn Notifier>>>,
    exit: CancellationToken,
}

impl Reporter {
    async fn finish(
        self,
        guard: UpdateGuard,
        (report, replacement): (Report, Option<Container>),
    ) -> Report {
        self.metrics.record(&report);

        let Some(current) = replacement else {
            drop(guard);
            self.notify(&report).await;
            return report;
        };
        self.notify(&report).await;
        match self_update::replace(&self.context, &current).await {
            Ok(id) => {
                info!("Handing over to container_id={id}");
                self.exit.cancel();
            }
            Err(e) => error!(
                "Self-update of {} failed container_id={} kind={} {e}",
                current.name,
                current.id,
                e.kind()
            ),
        }
        drop(guard);
        report
    }

    async fn notify(&self, report: &Report) {
        for notifier in self.notifiers.iter() {
            if let Err(e) = notifier.send(report).await {
                warn!("Notifier {} failed: {e}", notifier.name());
            }
        }
    }
}

fn aborted(e: JoinError) -> Report {
    error!("Update session aborted: {e}");
    let mut builder = ReportBuilder::default();
    builder.fail(SessionError::Aborted(e.to_string()));
    builder.finish()
}

/// Owns the lock and runs sessions on behalf of the scheduler and the HTTP API.
pub struct Supervisor {
    context: Context,
    lock: UpdateLock,
    reporter: Reporter,
}

impl Supervisor {
    pub fn new(
        settings: Arc<Settings>,
        engine: Arc<dyn Engine>,
        probe: Arc<dyn RegistryProbe>,
        notifiers: Vec<Box<dyn Notifier>>,
        shutdown: CancellationToken,
    ) -> Supervisor {
        let context = Context {
            settings,
            engine,
            probe,
            token: shutdown,
        };
        Supervisor {
            reporter: Reporter {
                context: context.clone(),
                metrics: Metrics::new(),
                notifiers: Arc::new(notifiers),
                exit: CancellationToken::new(),
            },
            context,
            lock: UpdateLock::default(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(settings: Settings, engine: Arc<testing::FakeEngine>) -> Supervisor {
        Supervisor::new(
            Arc::new(settings),
            engine,
            Arc::new(testing::FakeProbe::default()),
            vec![Box::new(crate::notify::LogNotifier::new(false))],
            CancellationToken::new(),
        )
    }

    pub fn lock(&self) -> &UpdateLock {
        &self.lock
    }

    pub fn metrics(&self) -> &Metrics {
        &self.reporter.metrics
    }

    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    /// Cancelled once a replacement supervisor has taken over.
    pub fn exit_requested(&self) -> CancellationToken {
        self.reporter.exit.clone()
    }

    /// Full session, rejected when another one is running.
    pub async fn try_update(&self) -> Result<Report, Busy> {
        let guard = self.lock.try_acquire().ok_or(Busy)?;
        Ok(self.run(guard, Filter::new(self.settings())).await)
    }

    /// Session restricted to `images`, queued behind a running one for at most `limit`.
    pub async fn update_images(
        &self,
        images: Vec<String>,
        limit: Option<Duration>,
    ) -> Result<Report, QueueTimeout> {
        let guard = self.lock.acquire_within(limit).await.ok_or(QueueTimeout)?;
        Ok(self
            .run(guard, Filter::new(self.settings()).with_images(images))
            .await)
    }

    /// Full session, waiting for the lock.
    pub async fn run_once(&self) -> Report {
        let guard = self.lock.acquire().await;
        self.run(guard, Filter::new(self.settings())).await
    }

    pub async fn close(&self) {
        for notifier in self.reporter.notifiers.iter() {
            notifier.close().await.log_error();
        }
    }

    /// The guard travels with the spawned task; the slot stays taken until the
    /// session and its handover are done even when the caller is dropped.
    async fn run(&self, guard: UpdateGuard, filter: Filter) -> Report {
        let session = Session::new(self.context.clone(), filter);
        let reporter = self.reporter.clone();
        let task = tokio::spawn(async move {
            let finished = match tokio::spawn(session.run()).await {
                Ok(finished) => finished,
                Err(e) => (aborted(e), None),
            };
            reporter.finish(guard, finished).await
        });
        task.await.unwrap_or_else(aborted)
    }
}

/// One discover, detect, execute, report and cleanup pass.
struct Session {
    context: Context,
    filter: Filter,
    report: ReportBuilder,
}

impl Session {
    fn new(context: Context, filter: Filter) -> Session {
        Session {
            context,
            filter,
            report: ReportBuilder::default(),
        }
    }

    fn record(&mut self, entry: Entry) {
        self.report.record(entry).log_error();
    }

    async fn run(mut self) -> (Report, Option<Container>) {
        match self.execute().await {
            Ok(replacement) => (self.report.finish(), replacement),
            Err(e) => {
                error!("Update session failed kind={} {e}", e.kind());
                self.report.fail(e);
                (self.report.finish(), None)
            }
        }
    }

    async fn execute(&mut self) -> Result<Option<Container>, SessionError> {
        let ctx = self.context.clone();
        let settings = ctx.settings.clone();

        let discovered = discovery::discover(&ctx).await?;
        let own = self_update::find_self(&discovered, settings.hostname.as_deref()).cloned();
        let retired = instances::guard(&ctx, &discovered, own.as_ref()).await?;
        let candidates: Vec<Container> = discovered
            .into_iter()
            .filter(|c| !retired.contains(&c.id) && self.filter.admits(c))
            .collect();
        info!("Checking {} containers for updated images", candidates.len());

        hooks::run_session(&ctx, &candidates, Hook::PreCheck).await;

        let mut nodes = Vec::new();
        let mut stale = HashSet::new();
        let mut frozen = HashSet::new();
        let mut latest = HashMap::new();
        let mut replacement = None;
        for container in &candidates {
            if ctx.cancelled() {
                self.record(Entry::skipped(container, ErrorKind::Cancelled));
                continue;
            }
            let policy = Policy::effective(&settings, container);
            let latest_image_id = match staleness::latest_image_id(&ctx, container, policy).await {
                Ok(id) => id,
                Err(ContainerError::Cancelled) => {
                    self.record(Entry::skipped(container, ErrorKind::Cancelled));
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Could not check {} container_id={} image={} kind={} {e}",
                        container.name,
                        container.id,
                        container.image_name(),
                        e.kind()
                    );
                    self.record(Entry::failed(container, &e));
                    continue;
                }
            };
            let is_stale = latest_image_id != container.image_id;
            let is_self = own.as_ref().is_some_and(|own| own.id == container.id);
            if is_stale {
                info!(
                    "Found new image for {} container_id={} image={} latest={latest_image_id}",
                    container.name,
                    container.id,
                    container.image_name()
                );
            } else {
                debug!("{} is up to date container_id={}", container.name, container.id);
            }

            if is_self || policy.monitor_only {
                frozen.insert(container.id.clone());
            }
            match (is_stale, is_self, policy.monitor_only) {
                (true, _, true) => {
                    self.record(
                        Entry::new(container, Outcome::MonitorOnlyStale)
                            .latest(Some(latest_image_id.clone())),
                    );
                }
                (true, true, false) if settings.no_self_update => {
                    self.record(
                        Entry::skipped(container, ErrorKind::SelfUpdateDisabled)
                            .latest(Some(latest_image_id.clone())),
                    );
                }
                (true, true, false) => {
                    self.record(
                        Entry::new(container, Outcome::Stale).latest(Some(latest_image_id.clone())),
                    );
                    replacement = Some(container.clone());
                }
                (true, false, false) => {
                    stale.insert(container.id.clone());
                }
                (false, _, _) => {}
            }
            latest.insert(container.id.clone(), latest_image_id);
            nodes.push(container.clone());
        }

        let plan = sorter::plan(&nodes, &stale, &frozen);
        for cycle in &plan.cycles {
            let names: Vec<&str> = cycle
                .iter()
                .filter_map(|id| nodes.iter().find(|c| &c.id == id))
                .map(|c| c.name.as_str())
                .collect();
            for container in nodes.iter().filter(|c| cycle.contains(&c.id)) {
                let error = ContainerError::DependencyCycle(names.join(" -> "));
                warn!(
                    "Not updating {} container_id={} kind={} {error}",
                    container.name,
                    container.id,
                    error.kind()
                );
                self.record(
                    Entry::failed(container, &error).latest(latest.get(&container.id).cloned()),
                );
            }
        }

        let targets: HashMap<String, Target> = nodes
            .iter()
            .filter(|c| plan.order.contains(&c.id))
            .map(|c| {
                let target = Target {
                    container: c.clone(),
                    latest_image_id: latest.get(&c.id).cloned().unwrap_or_default(),
                    restart_only: plan.restart.contains(&c.id),
                };
                (c.id.clone(), target)
            })
            .collect();
        let outcome = executor::execute(&ctx, &plan, &targets, &mut self.report).await;

        for container in &nodes {
            if !self.report.contains(&container.id) {
                self.record(
                    Entry::new(container, Outcome::Fresh).latest(latest.get(&container.id).cloned()),
                );
            }
        }

        let post_check: Vec<Container> = nodes
            .iter()
            .filter(|c| !outcome.replaced.contains_key(&c.id) && !outcome.down.contains(&c.id))
            .cloned()
            .chain(outcome.replaced.values().cloned())
            .collect();
        hooks::run_session(&ctx, &post_check, Hook::PostCheck).await;

        if settings.cleanup {
            cleanup::remove_images(&ctx, &outcome.obsolete_images).await;
        }
        Ok(replacement)
    }
}
