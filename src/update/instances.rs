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

use std::{collections::HashSet, time::Duration};

use log::{info, warn};

use super::Context;
use crate::{container::Container, error::SessionError};

/// Enforces one supervisor per scope.
///
/// Older supervisors running a different image are leftovers of a self-update
/// and are removed when cleanup is enabled. Any older peer that remains makes
/// this, the most recently started instance, abort. Returns the ids removed.
pub async fn guard(
    ctx: &Context,
    containers: &[Container],
    own: Option<&Container>,
) -> Result<HashSet<String>, SessionError> {
    let mut removed = HashSet::new();
    let Some(own) = own else {
        return Ok(removed);
    };
    let peers: Vec<&Container> = containers
        .iter()
        .filter(|c| c.id != own.id && c.is_supervisor() && c.scope() == own.scope())
        .collect();

    let mut survivors = 0;
    for peer in peers {
        if peer.created > own.created {
            warn!(
                "Newer supervisor {} container_id={} is running in the same scope",
                peer.name, peer.id
            );
            continue;
        }
        if peer.image_id == own.image_id || !ctx.settings.cleanup {
            warn!(
                "Older supervisor {} container_id={} is running in the same scope",
                peer.name, peer.id
            );
            survivors += 1;
            continue;
        }
        info!(
            "Removing older supervisor {} container_id={} image={}",
            peer.name,
            peer.id,
            peer.image_name()
        );
        let timeout = ctx.settings.stop_timeout;
        let stopped = ctx
            .call(ctx.engine.stop_container(&peer.id, peer.stop_signal(), timeout))
            .await;
        let result = match stopped {
            Ok(()) => {
                ctx.complete(
                    Duration::ZERO,
                    ctx.engine
                        .remove_container(&peer.id, ctx.settings.remove_volumes),
                )
                .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                removed.insert(peer.id.clone());
            }
            Err(e) => {
                warn!("Could not remove supervisor container_id={}: {e}", peer.id);
                survivors += 1;
            }
        }
    }

    if survivors > 0 {
        return Err(SessionError::MultipleInstances(format!(
            "{} instances in scope {}",
            survivors + 1,
            own.scope().unwrap_or("<none>")
        )));
    }
    Ok(removed)
}
