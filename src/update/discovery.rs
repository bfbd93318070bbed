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

use log::debug;

use super::Context;
use crate::{
    container::Container,
    engine::ContainerStatus,
    error::SessionError,
    settings::Settings,
};

/// Container states a session looks at.
pub fn statuses(settings: &Settings) -> Vec<ContainerStatus> {
    let mut statuses = vec![ContainerStatus::Running];
    if settings.include_stopped {
        statuses.extend([ContainerStatus::Created, ContainerStatus::Exited]);
    }
    if settings.include_restarting {
        statuses.push(ContainerStatus::Restarting);
    }
    statuses
}

/// Snapshots of all listed containers in engine order.
pub async fn discover(ctx: &Context) -> Result<Vec<Container>, SessionError> {
    let summaries = ctx
        .call(ctx.engine.list_containers(&statuses(&ctx.settings)))
        .await
        .map_err(|e| SessionError::DiscoveryFailed(format!("listing containers: {e}")))?;
    let mut containers = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let container = ctx
            .call(ctx.engine.inspect_container(&summary.id))
            .await
            .map_err(|e| {
                SessionError::DiscoveryFailed(format!("inspecting {}: {e}", summary.name))
            })?;
        debug!(
            "Discovered {} container_id={} image={} status={}",
            container.name,
            container.id,
            container.image_name(),
            container.status.as_str()
        );
        containers.push(container);
    }
    Ok(containers)
}
