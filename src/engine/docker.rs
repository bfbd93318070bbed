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

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    Docker,
    auth::DockerCredentials,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        ListContainersOptions, NetworkingConfig, RemoveContainerOptions, RenameContainerOptions,
        StartContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::{CreateImageOptions, RemoveImageOptions},
    models::{ContainerInspectResponse, ContainerStateStatusEnum},
    network::ConnectNetworkOptions,
};
use log::{debug, trace, warn};
use tokio::time::{Instant, sleep};
use tokio_stream::StreamExt;

use super::{
    ContainerStatus, ContainerSummary, CreateSpec, Engine, EngineError, EngineResult, ImageRecord,
};
use crate::{container::Container, registry::Credentials};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

impl From<DockerError> for EngineError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::Conflict(message),
            err => EngineError::Api(err.to_string()),
        }
    }
}

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects using `DOCKER_HOST` (or the local socket) and negotiates the API version.
    pub async fn connect() -> EngineResult<DockerEngine> {
        let docker = Docker::connect_with_local_defaults()?;
        let docker = docker.negotiate_version().await?;
        debug!("Connected to container engine, API version {:?}", docker.client_version());
        Ok(DockerEngine { docker })
    }

    async fn is_running(&self, id: &str) -> EngineResult<bool> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(err) => match EngineError::from(err) {
                EngineError::NotFound(_) => Ok(false),
                err => Err(err),
            },
        }
    }

    async fn wait_for_exit(&self, id: &str, timeout: Duration) -> EngineResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running(id).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn kill(&self, id: &str, signal: &str) -> EngineResult<()> {
        let options = KillContainerOptions { signal };
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // the container exited on its own in the meantime
            Err(err) => match EngineError::from(err) {
                EngineError::Conflict(_) | EngineError::NotFound(_) => Ok(()),
                err => Err(err),
            },
        }
    }
}

fn status(info: &ContainerInspectResponse) -> ContainerStatus {
    match info.state.as_ref().and_then(|state| state.status.as_ref()) {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Exited,
    }
}

fn container(info: ContainerInspectResponse, image: Option<ImageRecord>) -> EngineResult<Container> {
    let id = info
        .id
        .clone()
        .ok_or_else(|| EngineError::Api("container without id".to_string()))?;
    let status = status(&info);
    Ok(Container {
        name: info
            .name
            .as_deref()
            .unwrap_or(&id)
            .trim_start_matches('/')
            .to_string(),
        created: info.created.unwrap_or_default(),
        status,
        image_id: info.image.unwrap_or_default(),
        config: info.config.unwrap_or_default(),
        host_config: info.host_config.unwrap_or_default(),
        networks: info
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default(),
        image,
        id,
    })
}

fn image_record(id_or_reference: &str, image: bollard::models::ImageInspect) -> ImageRecord {
    ImageRecord {
        id: image.id.unwrap_or_else(|| id_or_reference.to_string()),
        created: image.created,
        repo_tags: image.repo_tags.unwrap_or_default(),
        repo_digests: image.repo_digests.unwrap_or_default(),
        config: image.config,
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn list_containers(
        &self,
        statuses: &[ContainerStatus],
    ) -> EngineResult<Vec<ContainerSummary>> {
        let filters = HashMap::from([(
            "status".to_string(),
            statuses.iter().map(|s| s.as_str().to_string()).collect(),
        )]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerSummary {
                    name,
                    image_id: c.image_id.unwrap_or_default(),
                    status: c
                        .state
                        .as_deref()
                        .and_then(ContainerStatus::parse)
                        .unwrap_or(ContainerStatus::Exited),
                    id,
                })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<Container> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let image = match info.image.as_deref() {
            Some(image_id) => self.inspect_image(image_id).await?,
            None => None,
        };
        container(info, image)
    }

    async fn stop_container(&self, id: &str, signal: &str, timeout: Duration) -> EngineResult<()> {
        if !self.is_running(id).await? {
            return Ok(());
        }
        debug!("Sending {signal} to container_id={id}");
        self.kill(id, signal).await?;
        if self.wait_for_exit(id, timeout).await? {
            return Ok(());
        }
        warn!("container_id={id} did not stop within {timeout:?}, sending SIGKILL");
        self.kill(id, "SIGKILL").await?;
        if self.wait_for_exit(id, timeout).await? {
            Ok(())
        } else {
            Err(EngineError::Timeout(timeout))
        }
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: remove_volumes,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // auto-removed containers vanish on stop
            Err(err) => match EngineError::from(err) {
                EngineError::NotFound(_) => Ok(()),
                err => Err(err),
            },
        }
    }

    async fn rename_container(&self, id: &str, name: &str) -> EngineResult<()> {
        let options = RenameContainerOptions { name };
        self.docker.rename_container(id, options).await?;
        Ok(())
    }

    async fn create_container(&self, spec: &CreateSpec) -> EngineResult<String> {
        let mut networks = spec.networks.iter();
        let mut config: Config<String> = spec.config.clone().into();
        config.host_config = Some(spec.host_config.clone());
        config.networking_config = networks.next().map(|(name, endpoint)| NetworkingConfig {
            endpoints_config: HashMap::from([(name.clone(), endpoint.clone())]),
        });
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            warn!("Engine warning for {}: {warning}", spec.name);
        }
        for (name, endpoint) in networks {
            debug!("Connecting container_id={} to network {name}", response.id);
            let options = ConnectNetworkOptions {
                container: response.id.clone(),
                endpoint_config: endpoint.clone(),
            };
            self.docker.connect_network(name, options).await?;
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<&Credentials>,
    ) -> EngineResult<()> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let credentials = credentials.map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            ..Default::default()
        });
        let mut progress = self.docker.create_image(Some(options), None, credentials);
        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(status) = info.status {
                trace!("{reference}: {status}");
            }
        }
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> EngineResult<Option<ImageRecord>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(image_record(reference, image))),
            Err(err) => match EngineError::from(err) {
                EngineError::NotFound(_) => Ok(None),
                err => Err(err),
            },
        }
    }

    async fn remove_image(&self, id: &str) -> EngineResult<()> {
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        let removed = self.docker.remove_image(id, Some(options), None).await?;
        for item in removed {
            if let Some(deleted) = item.deleted {
                debug!("Deleted image layer {deleted}");
            }
            if let Some(untagged) = item.untagged {
                debug!("Untagged {untagged}");
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        command: &str,
        user: Option<&str>,
        timeout: Option<Duration>,
    ) -> EngineResult<i64> {
        let options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            user: user.map(str::to_string),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, options).await?;
        let run = async {
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None::<StartExecOptions>)
                .await?
            {
                while let Some(line) = output.next().await {
                    debug!("[{id}] {}", line?);
                }
            }
            let inspect = self.docker.inspect_exec(&exec.id).await?;
            Ok::<i64, EngineError>(inspect.exit_code.unwrap_or(-1))
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| EngineError::Timeout(limit))?,
            None => run.await,
        }
    }
}
