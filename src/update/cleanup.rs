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

use std::collections::HashSet;

use log::{debug, info, warn};

use super::Context;
use crate::engine::ContainerStatus;

/// Removes images replaced during the session that no container uses anymore.
pub async fn remove_images(ctx: &Context, images: &[String]) {
    if images.is_empty() {
        return;
    }
    let in_use: HashSet<String> = match ctx
        .call(ctx.engine.list_containers(&ContainerStatus::ALL))
        .await
    {
        Ok(containers) => containers.into_iter().map(|c| c.image_id).collect(),
        Err(e) => {
            warn!("Skipping image cleanup, could not list containers: {e}");
            return;
        }
    };
    let mut seen = HashSet::new();
    for image in images {
        if !seen.insert(image) {
            continue;
        }
        if in_use.contains(image) {
            debug!("Keeping image {image}, still in use");
            continue;
        }
        match ctx.call(ctx.engine.remove_image(image)).await {
            Ok(()) => info!("Removed image {image}"),
            Err(e) => warn!("Could not remove image {image}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::remove_images;
    use crate::{
        container::tests::container,
        engine::ContainerStatus,
        settings::Settings,
        update::{
            Context,
            testing::{Event, FakeEngine, FakeProbe},
        },
    };

    #[tokio::test]
    async fn keeps_images_in_use() {
        let engine = Arc::new(FakeEngine::default());
        engine.add(container("web", "nginx", "sha256:new"));
        let mut stopped = container("old", "nginx:1.26", "sha256:shared");
        stopped.status = ContainerStatus::Exited;
        engine.add(stopped);
        engine.tag("nginx:1.25", "sha256:old");
        let ctx = Context {
            settings: Arc::new(Settings::default()),
            engine: engine.clone(),
            probe: Arc::new(FakeProbe::default()),
            token: CancellationToken::new(),
        };

        remove_images(
            &ctx,
            &[
                "sha256:old".to_string(),
                "sha256:shared".to_string(),
                "sha256:old".to_string(),
            ],
        )
        .await;
        assert_eq!(
            engine.events(),
            vec![Event::RemoveImage("sha256:old".to_string())]
        );
        assert!(!engine.has_image("sha256:old"));
        assert!(engine.has_image("sha256:shared"));
    }
}
