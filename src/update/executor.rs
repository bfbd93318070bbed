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

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use log::{info, warn};
use tokio::time::Instant;

use super::{
    Context,
    hooks::{self, HookOutcome},
    sorter::Plan,
};
use crate::{
    container::{Container, Hook},
    engine::{ContainerStatus, CreateSpec, EngineError},
    error::{ContainerError, ErrorKind},
    log::LogError,
    report::{Entry, Outcome, ReportBuilder},
};

const START_POLL: Duration = Duration::from_millis(250);

/// A container the plan acts on.
#[derive(Debug, Clone)]
pub struct Target {
    pub container: Container,
    pub latest_image_id: String,
    /// Fresh, only re-created for the sake of a dependency.
    pub restart_only: bool,
}

/// What the executor changed on the engine.
#[derive(Debug, Default)]
pub struct Execution {
    /// Replacement snapshots by the id of the container they replace.
    pub replaced: HashMap<String, Container>,
    /// Ids of containers left stopped or removed without replacement.
    pub down: HashSet<String>,
    /// Image ids no replaced container runs anymore.
    pub obsolete_images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Proceed,
    Skipped,
    Failed,
}

struct Executor<'a> {
    ctx: &'a Context,
    report: &'a mut ReportBuilder,
    execution: Execution,
}

/// Walks the plan in group or rolling mode and records one entry per target.
pub async fn execute(
    ctx: &Context,
    plan: &Plan,
    targets: &HashMap<String, Target>,
    report: &mut ReportBuilder,
) -> Execution {
    let mut executor = Executor {
        ctx,
        report,
        execution: Execution::default(),
    };
    let order: Vec<&Target> = plan.order.iter().filter_map(|id| targets.get(id)).collect();
    if ctx.settings.rolling_restart {
        executor.rolling(&order, plan).await;
    } else {
        executor.group(&order).await;
    }
    executor.execution
}

impl Executor<'_> {
    fn record(&mut self, target: &Target, entry: Entry) {
        self.report
            .record(entry.latest(Some(target.latest_image_id.clone())))
            .log_error();
    }

    fn fail(&mut self, target: &Target, error: ContainerError, new_container_id: Option<String>) {
        let container = &target.container;
        warn!(
            "Update of {} failed container_id={} image={} kind={} {error}",
            container.name,
            container.id,
            container.image_name(),
            error.kind()
        );
        let entry = Entry {
            new_container_id,
            ..Entry::failed(container, &error)
        };
        self.record(target, entry);
    }

    fn skip(&mut self, target: &Target, kind: ErrorKind) {
        info!(
            "Skipping {} container_id={} kind={kind}",
            target.container.name, target.container.id
        );
        self.record(target, Entry::skipped(&target.container, kind));
    }

    async fn group(&mut self, order: &[&Target]) {
        let mut stopped = Vec::new();
        for target in order.iter().rev() {
            if self.ctx.cancelled() {
                self.skip(target, ErrorKind::Cancelled);
                continue;
            }
            if self.stop(target).await == Step::Proceed {
                stopped.push(target.container.id.as_str());
            }
        }
        for target in order {
            if stopped.contains(&target.container.id.as_str()) {
                self.start(target).await;
            }
        }
    }

    async fn rolling(&mut self, order: &[&Target], plan: &Plan) {
        let mut aborted = false;
        for target in order {
            if aborted {
                self.skip(target, ErrorKind::RollingAborted);
                continue;
            }
            if self.ctx.cancelled() {
                self.skip(target, ErrorKind::Cancelled);
                continue;
            }
            let step = match self.stop(target).await {
                Step::Proceed => self.start(target).await,
                step => step,
            };
            let id = &target.container.id;
            if step == Step::Failed && plan.dependents.get(id).is_some_and(|d| !d.is_empty()) {
                warn!(
                    "Aborting rolling restart, {} failed and has dependents",
                    target.container.name
                );
                aborted = true;
            }
        }
    }

    /// Pre-update hook and stop.
    async fn stop(&mut self, target: &Target) -> Step {
        let container = &target.container;
        match hooks::run(self.ctx, container, Hook::PreUpdate).await {
            HookOutcome::Done => {}
            HookOutcome::Skip => {
                self.skip(target, ErrorKind::PreHookSkipped);
                return Step::Skipped;
            }
            HookOutcome::Cancelled => {
                self.skip(target, ErrorKind::Cancelled);
                return Step::Skipped;
            }
            HookOutcome::Failed(reason) => {
                self.fail(target, ContainerError::PreHookFailed(reason), None);
                return Step::Failed;
            }
        }
        if !container.is_running() {
            return Step::Proceed;
        }
        let timeout = self.ctx.settings.stop_timeout;
        info!(
            "Stopping {} container_id={} signal={}",
            container.name,
            container.id,
            container.stop_signal()
        );
        let stopped = self
            .ctx
            .complete(
                timeout * 2,
                self.ctx
                    .engine
                    .stop_container(&container.id, container.stop_signal(), timeout),
            )
            .await;
        match stopped {
            Ok(()) => Step::Proceed,
            Err(e) => {
                self.fail(target, ContainerError::StopFailed(e.to_string()), None);
                Step::Failed
            }
        }
    }

    /// Remove, re-create, start and post-update hook.
    async fn start(&mut self, target: &Target) -> Step {
        let ctx = self.ctx;
        let container = &target.container;
        if let Err(e) = ctx
            .complete(
                Duration::ZERO,
                ctx.engine
                    .remove_container(&container.id, ctx.settings.remove_volumes),
            )
            .await
        {
            self.execution.down.insert(container.id.clone());
            self.fail(target, ContainerError::RemoveFailed(e.to_string()), None);
            return Step::Failed;
        }

        let spec = container.create_spec(container.image_name(), ctx.settings.cpu_copy_mode);
        let (id, name) = match self.create(container, spec).await {
            Ok(created) => created,
            Err(e) => {
                self.execution.down.insert(container.id.clone());
                self.fail(target, e, None);
                return Step::Failed;
            }
        };
        if !target.restart_only && container.image_id != target.latest_image_id {
            self.execution
                .obsolete_images
                .push(container.image_id.clone());
        }
        let mut replacement = Container {
            id: id.clone(),
            name,
            status: ContainerStatus::Created,
            image_id: target.latest_image_id.clone(),
            ..container.clone()
        };

        let settings = &ctx.settings;
        let start = !settings.no_restart && (container.is_running() || settings.revive_stopped);
        if start {
            info!("Starting {} container_id={id}", replacement.name);
            let started = match ctx
                .complete(Duration::ZERO, ctx.engine.start_container(&id))
                .await
            {
                Ok(()) => self.wait_running(&id).await,
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = started {
                self.execution
                    .replaced
                    .insert(container.id.clone(), replacement);
                self.fail(target, ContainerError::StartFailed(reason), Some(id));
                return Step::Failed;
            }
            replacement.status = ContainerStatus::Running;
        }

        let post_hook = hooks::run(ctx, &replacement, Hook::PostUpdate).await;
        self.execution
            .replaced
            .insert(container.id.clone(), replacement);
        if let HookOutcome::Failed(reason) = post_hook {
            self.fail(target, ContainerError::PostHookFailed(reason), Some(id));
            return Step::Failed;
        }

        let outcome = if target.restart_only {
            Outcome::Restarted
        } else {
            Outcome::Updated
        };
        info!(
            "{} {} container_id={} image={} new_container_id={id}",
            if target.restart_only { "Restarted" } else { "Updated" },
            container.name,
            container.id,
            container.image_name()
        );
        let entry = Entry {
            new_container_id: Some(id),
            ..Entry::new(container, outcome)
        };
        self.record(target, entry);
        Step::Proceed
    }

    /// Creates the replacement under the old name, falling back to a suffixed
    /// name when the engine still holds the old one.
    async fn create(
        &self,
        container: &Container,
        mut spec: CreateSpec,
    ) -> Result<(String, String), ContainerError> {
        let ctx = self.ctx;
        match ctx
            .complete(Duration::ZERO, ctx.engine.create_container(&spec))
            .await
        {
            Ok(id) => return Ok((id, spec.name)),
            Err(EngineError::Conflict(e)) => {
                let suffix = &container.id[..container.id.len().min(8)];
                let name = format!("{}-{suffix}", spec.name);
                warn!(
                    "Name {} is taken ({e}), creating replacement as {name}",
                    spec.name
                );
                spec.name = name;
            }
            Err(e) => return Err(ContainerError::CreateFailed(e.to_string())),
        }
        ctx.complete(Duration::ZERO, ctx.engine.create_container(&spec))
            .await
            .map(|id| (id, spec.name))
            .map_err(|e| ContainerError::CreateFailed(e.to_string()))
    }

    async fn wait_running(&self, id: &str) -> Result<(), String> {
        let ctx = self.ctx;
        let timeout = ctx.settings.stop_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let container = ctx
                .complete(Duration::ZERO, ctx.engine.inspect_container(id))
                .await
                .map_err(|e| e.to_string())?;
            if container.is_running() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "container is {} after {timeout:?}",
                    container.status.as_str()
                ));
            }
            tokio::time::sleep(START_POLL).await;
        }
    }
}
