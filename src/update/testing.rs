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

//! In-memory engine and registry used by the session tests.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    container::Container,
    engine::{
        ContainerStatus, ContainerSummary, CreateSpec, Engine, EngineError, EngineResult,
        ImageRecord,
    },
    registry::{Credentials, RegistryProbe, canonical},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Stop(String),
    Remove(String),
    Rename(String, String),
    Create(String),
    Start(String),
    Pull(String),
    RemoveImage(String),
    Exec(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Inspect,
    Stop,
    Remove,
    Create,
    Start,
    Pull,
}

#[derive(Default)]
struct State {
    containers: Vec<Container>,
    images: HashMap<String, ImageRecord>,
    local: HashMap<String, String>,
    remote: HashMap<String, String>,
    failures: HashMap<(Op, String), EngineError>,
    exit_codes: HashMap<String, i64>,
    events: Vec<Event>,
    created: u64,
    trigger: Option<(Event, CancellationToken)>,
}

impl State {
    fn record(&mut self, event: Event) {
        if let Some((on, token)) = &self.trigger
            && *on == event
        {
            token.cancel();
        }
        self.events.push(event);
    }

    fn fail(&self, op: Op, target: &str) -> EngineResult<()> {
        match self.failures.get(&(op, target.to_string())) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn find(&mut self, id: &str) -> EngineResult<&mut Container> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn register(&mut self, reference: &str, id: &str) {
        self.local.insert(canonical(reference), id.to_string());
        let record = self.images.entry(id.to_string()).or_insert_with(|| ImageRecord {
            id: id.to_string(),
            ..Default::default()
        });
        if !record.repo_tags.iter().any(|t| t == reference) {
            record.repo_tags.push(reference.to_string());
        }
    }
}

/// Engine double with an ordered event log and failure injection.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
    pull_delay: Mutex<Option<Duration>>,
    exec_delay: Mutex<Option<Duration>>,
}

impl FakeEngine {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Adds a container and makes its image known locally.
    pub fn add(&self, container: Container) {
        let mut state = self.state();
        let reference = container.image_name().to_string();
        if !state.local.contains_key(&canonical(&reference)) {
            state.register(&reference, &container.image_id);
        }
        state.containers.push(container);
    }

    /// Makes `image` resolve to `id` on the next pull.
    pub fn publish(&self, image: &str, id: &str) {
        self.state().remote.insert(canonical(image), id.to_string());
    }

    /// Tags `id` locally as `image` without a pull.
    pub fn tag(&self, image: &str, id: &str) {
        self.state().register(image, id);
    }

    pub fn fail(&self, op: Op, target: &str, error: EngineError) {
        self.state().failures.insert((op, target.to_string()), error);
    }

    pub fn exit_code(&self, command: &str, code: i64) {
        self.state().exit_codes.insert(command.to_string(), code);
    }

    pub fn pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = Some(delay);
    }

    /// Makes every exec hang for `delay` before answering.
    pub fn exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = Some(delay);
    }

    /// Cancels `token` as soon as `event` is logged.
    pub fn cancel_on(&self, event: Event, token: CancellationToken) {
        self.state().trigger = Some((event, token));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn container(&self, name: &str) -> Option<Container> {
        self.state().containers.iter().find(|c| c.name == name).cloned()
    }

    pub fn containers(&self) -> Vec<Container> {
        self.state().containers.clone()
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.state().images.contains_key(id)
    }

    /// Position of `event` in the log.
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.state().events.iter().position(|e| e == event)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn list_containers(
        &self,
        statuses: &[ContainerStatus],
    ) -> EngineResult<Vec<ContainerSummary>> {
        let state = self.state();
        state.fail(Op::List, "")?;
        Ok(state
            .containers
            .iter()
            .filter(|c| statuses.contains(&c.status))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image_id: c.image_id.clone(),
                status: c.status,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<Container> {
        let mut state = self.state();
        let container = state.find(id)?.clone();
        state.fail(Op::Inspect, &container.name)?;
        Ok(Container {
            image: state.images.get(&container.image_id).cloned(),
            ..container
        })
    }

    async fn stop_container(&self, id: &str, _signal: &str, _timeout: Duration) -> EngineResult<()> {
        let mut state = self.state();
        let name = state.find(id)?.name.clone();
        state.fail(Op::Stop, &name)?;
        state.find(id)?.status = ContainerStatus::Exited;
        state.record(Event::Stop(name));
        Ok(())
    }

    async fn remove_container(&self, id: &str, _remove_volumes: bool) -> EngineResult<()> {
        let mut state = self.state();
        let Some(index) = state.containers.iter().position(|c| c.id == id) else {
            return Ok(());
        };
        let name = state.containers[index].name.clone();
        state.fail(Op::Remove, &name)?;
        state.containers.remove(index);
        state.record(Event::Remove(name));
        Ok(())
    }

    async fn rename_container(&self, id: &str, name: &str) -> EngineResult<()> {
        let mut state = self.state();
        if state.containers.iter().any(|c| c.name == name) {
            return Err(EngineError::Conflict(name.to_string()));
        }
        let container = state.find(id)?;
        let old = std::mem::replace(&mut container.name, name.to_string());
        state.record(Event::Rename(old, name.to_string()));
        Ok(())
    }

    async fn create_container(&self, spec: &CreateSpec) -> EngineResult<String> {
        let mut state = self.state();
        state.fail(Op::Create, &spec.name)?;
        if state.containers.iter().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict(spec.name.clone()));
        }
        let reference = spec.config.image.clone().unwrap_or_default();
        let image_id = state
            .local
            .get(&canonical(&reference))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(reference.clone()))?;
        state.created += 1;
        let id = format!("{:0>12x}{}", state.created, "f".repeat(52));
        let created = format!("2025-06-01T00:00:{:02}Z", state.created % 60);
        state.containers.push(Container {
            id: id.clone(),
            name: spec.name.clone(),
            created,
            status: ContainerStatus::Created,
            image_id,
            config: spec.config.clone(),
            host_config: spec.host_config.clone(),
            networks: spec.networks.iter().cloned().collect(),
            image: None,
        });
        state.record(Event::Create(spec.name.clone()));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state();
        let name = state.find(id)?.name.clone();
        state.fail(Op::Start, &name)?;
        state.find(id)?.status = ContainerStatus::Running;
        state.record(Event::Start(name));
        Ok(())
    }

    async fn pull_image(
        &self,
        reference: &str,
        _credentials: Option<&Credentials>,
    ) -> EngineResult<()> {
        let delay = *self.pull_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        let reference = canonical(reference);
        state.record(Event::Pull(reference.clone()));
        state.fail(Op::Pull, &reference)?;
        match state.remote.get(&reference).cloned() {
            Some(id) => {
                state.register(&reference, &id);
                Ok(())
            }
            None => Err(EngineError::NotFound(reference)),
        }
    }

    async fn inspect_image(&self, reference: &str) -> EngineResult<Option<ImageRecord>> {
        let state = self.state();
        if let Some(image) = state.images.get(reference) {
            return Ok(Some(image.clone()));
        }
        Ok(state
            .local
            .get(&canonical(reference))
            .and_then(|id| state.images.get(id))
            .cloned())
    }

    async fn remove_image(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.record(Event::RemoveImage(id.to_string()));
        if state.containers.iter().any(|c| c.image_id == id) {
            return Err(EngineError::Conflict(id.to_string()));
        }
        state.images.remove(id);
        state.local.retain(|_, image| *image != id);
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        command: &str,
        _user: Option<&str>,
        _timeout: Option<Duration>,
    ) -> EngineResult<i64> {
        let delay = *self.exec_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        let name = state.find(id)?.name.clone();
        state.record(Event::Exec(name, command.to_string()));
        Ok(state.exit_codes.get(command).copied().unwrap_or(0))
    }
}

/// Registry double answering manifest digests from a fixed table.
#[derive(Default)]
pub struct FakeProbe {
    digests: Mutex<HashMap<String, String>>,
}

impl FakeProbe {
    pub fn digest(&self, image: &str, digest: &str) {
        self.digests
            .lock()
            .unwrap()
            .insert(canonical(image), digest.to_string());
    }
}

#[async_trait]
impl RegistryProbe for FakeProbe {
    async fn manifest_digest(&self, image: &str) -> Result<String> {
        self.digests
            .lock()
            .unwrap()
            .get(&canonical(image))
            .cloned()
            .ok_or_else(|| anyhow!("no manifest for {image}"))
    }
}
