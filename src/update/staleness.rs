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

use log::{debug, warn};

use super::Context;
use crate::{
    container::{Container, Policy},
    engine::EngineError,
    error::ContainerError,
    registry::{has_digest, is_well_known_registry, with_default_tag},
    settings::WarnOnHeadFailure,
};

fn pull_error(image: &str, error: EngineError) -> ContainerError {
    match error {
        EngineError::NotFound(_) => ContainerError::ImageUnresolvable(format!("{image}: {error}")),
        EngineError::Cancelled => ContainerError::Cancelled,
        error => ContainerError::PullFailed(format!("{image}: {error}")),
    }
}

fn head_failed(ctx: &Context, image: &str, error: &EngineError) {
    let warn = match ctx.settings.warn_on_head_failure {
        WarnOnHeadFailure::Always => true,
        WarnOnHeadFailure::Never => false,
        WarnOnHeadFailure::Auto => is_well_known_registry(image),
    };
    if warn {
        warn!("Could not do a head request for {image}, falling back to regular pull: {error}");
    } else {
        debug!("Could not do a head request for {image}, falling back to regular pull: {error}");
    }
}

/// Whether the registry still serves the digest the container runs.
async fn unchanged_in_registry(ctx: &Context, container: &Container, image: &str) -> bool {
    let Some(running) = container.image.as_ref() else {
        return false;
    };
    if running.repo_digests.is_empty() {
        return false;
    }
    let probe = ctx.probe.clone();
    let digest = ctx
        .call(async {
            probe
                .manifest_digest(image)
                .await
                .map_err(|e| EngineError::Api(e.to_string()))
        })
        .await;
    match digest {
        Ok(digest) if has_digest(&running.repo_digests, &digest) => {
            debug!("No pull needed for {image}, digest {digest} unchanged");
            true
        }
        Ok(digest) => {
            debug!("Registry advertises {digest} for {image}");
            false
        }
        Err(e) => {
            head_failed(ctx, image, &e);
            false
        }
    }
}

/// Id of the image the container's reference resolves to after an optional pull.
pub async fn latest_image_id(
    ctx: &Context,
    container: &Container,
    policy: Policy,
) -> Result<String, ContainerError> {
    if container.is_pinned() {
        debug!("{} is pinned by digest", container.name);
        return Ok(container.image_id.clone());
    }
    if container.image_name().is_empty() {
        return Err(ContainerError::ImageUnresolvable(
            "container has no image reference".to_string(),
        ));
    }
    let image = with_default_tag(container.image_name());

    if !policy.no_pull {
        if unchanged_in_registry(ctx, container, &image).await {
            return Ok(container.image_id.clone());
        }
        debug!("Pulling {image} for {}", container.name);
        ctx.call(
            ctx.engine
                .pull_image(&image, ctx.settings.credentials.for_image(&image)),
        )
        .await
        .map_err(|e| pull_error(&image, e))?;
    }

    match ctx.call(ctx.engine.inspect_image(&image)).await {
        Ok(Some(record)) => Ok(record.id),
        Ok(None) => Err(ContainerError::ImageUnresolvable(format!(
            "{image}: no local image"
        ))),
        Err(e) => Err(pull_error(&image, e)),
    }
}
