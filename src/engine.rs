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

mod docker;

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bollard::models::{ContainerConfig, EndpointSettings, HostConfig};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{container::Container, registry::Credentials};

pub use docker::DockerEngine;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Api(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
        }
    }

    pub fn parse(status: &str) -> Option<ContainerStatus> {
        match status {
            "created" => Some(ContainerStatus::Created),
            "running" => Some(ContainerStatus::Running),
            "paused" => Some(ContainerStatus::Paused),
            "restarting" => Some(ContainerStatus::Restarting),
            "removing" => Some(ContainerStatus::Removing),
            "exited" => Some(ContainerStatus::Exited),
            "dead" => Some(ContainerStatus::Dead),
            _ => None,
        }
    }

    pub const ALL: [ContainerStatus; 7] = [
        ContainerStatus::Created,
        ContainerStatus::Running,
        ContainerStatus::Paused,
        ContainerStatus::Restarting,
        ContainerStatus::Removing,
        ContainerStatus::Exited,
        ContainerStatus::Dead,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub created: Option<String>,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub config: Option<ContainerConfig>,
}

/// Everything the engine needs to create a replacement container.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSpec {
    pub name: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    /// Network attachments; the first one is attached at creation time.
    pub networks: Vec<(String, EndpointSettings)>,
}

/// Capabilities the supervisor requires from a container engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Containers in any of the given states, in engine order.
    async fn list_containers(
        &self,
        statuses: &[ContainerStatus],
    ) -> EngineResult<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> EngineResult<Container>;

    /// Sends `signal`, waits up to `timeout` and force-kills if still running.
    async fn stop_container(&self, id: &str, signal: &str, timeout: Duration) -> EngineResult<()>;

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()>;

    async fn rename_container(&self, id: &str, name: &str) -> EngineResult<()>;

    /// Returns the id of the new container.
    async fn create_container(&self, spec: &CreateSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    async fn pull_image(&self, reference: &str, credentials: Option<&Credentials>)
    -> EngineResult<()>;

    /// `None` when the engine has no image for `reference`.
    async fn inspect_image(&self, reference: &str) -> EngineResult<Option<ImageRecord>>;

    async fn remove_image(&self, id: &str) -> EngineResult<()>;

    /// Runs `command` through `sh -c` inside the container and returns its exit code.
    async fn exec(
        &self,
        id: &str,
        command: &str,
        user: Option<&str>,
        timeout: Option<Duration>,
    ) -> EngineResult<i64>;
}

/// Races an engine call against cancellation and a deadline.
pub async fn guarded<T, F>(token: &CancellationToken, limit: Duration, call: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    tokio::select! {
        () = token.cancelled() => Err(EngineError::Cancelled),
        result = tokio::time::timeout(limit, call) => {
            result.unwrap_or(Err(EngineError::Timeout(limit)))
        }
    }
}
