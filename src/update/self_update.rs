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

use std::time::Duration;

use log::{info, warn};

use super::Context;
use crate::{container::Container, error::ContainerError};

/// The container this process runs in, matched by hostname.
pub fn find_self<'a>(containers: &'a [Container], hostname: Option<&str>) -> Option<&'a Container> {
    let hostname = hostname?;
    containers.iter().find(|c| {
        (hostname.len() >= 12 && c.id.starts_with(hostname))
            || c.config.hostname.as_deref() == Some(hostname)
    })
}

/// Replaces the running supervisor with one started from the freshly pulled image.
///
/// The current container is renamed out of the way, the replacement takes over
/// its name and configuration, and the renamed container is removed last.
pub async fn replace(ctx: &Context, current: &Container) -> Result<String, ContainerError> {
    let engine = &ctx.engine;
    let retired = format!("{}-old-{}", current.name, current.short_id());
    info!(
        "Updating supervisor {} container_id={} image={}",
        current.name,
        current.id,
        current.image_name()
    );
    ctx.complete(Duration::ZERO, engine.rename_container(&current.id, &retired))
        .await
        .map_err(|e| ContainerError::CreateFailed(format!("renaming to {retired}: {e}")))?;

    let spec = current.create_spec(current.image_name(), ctx.settings.cpu_copy_mode);
    let id = match ctx
        .complete(Duration::ZERO, engine.create_container(&spec))
        .await
    {
        Ok(id) => id,
        Err(e) => {
            restore(ctx, current).await;
            return Err(ContainerError::CreateFailed(e.to_string()));
        }
    };
    if let Err(e) = ctx
        .complete(Duration::ZERO, engine.start_container(&id))
        .await
    {
        if let Err(e) = ctx
            .complete(Duration::ZERO, engine.remove_container(&id, false))
            .await
        {
            warn!("Could not remove failed replacement container_id={id}: {e}");
        }
        restore(ctx, current).await;
        return Err(ContainerError::StartFailed(e.to_string()));
    }

    info!("Started replacement supervisor container_id={id}, removing {retired}");
    if let Err(e) = ctx
        .complete(Duration::ZERO, engine.remove_container(&current.id, false))
        .await
    {
        warn!("Could not remove {retired} container_id={}: {e}", current.id);
    }
    Ok(id)
}

async fn restore(ctx: &Context, current: &Container) {
    if let Err(e) = ctx
        .complete(
            Duration::ZERO,
            ctx.engine.rename_container(&current.id, &current.name),
        )
        .await
    {
        warn!(
            "Could not rename container_id={} back to {}: {e}",
            current.id, current.name
        );
    }
}
