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

use log::{debug, info, warn};

use super::Context;
use crate::{
    container::{Container, Hook},
    engine::EngineError,
};

/// Exit code with which a pre-update hook asks to skip the update.
const EX_TEMPFAIL: i64 = 75;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Done,
    Skip,
    /// Interrupted by session cancellation.
    Cancelled,
    Failed(String),
}

/// Runs `hook` inside `container` when hooks are enabled and the label is set.
pub async fn run(ctx: &Context, container: &Container, hook: Hook) -> HookOutcome {
    if !ctx.settings.lifecycle_hooks {
        return HookOutcome::Done;
    }
    let Some(command) = container.hook_command(hook) else {
        return HookOutcome::Done;
    };
    if !container.is_running() {
        debug!(
            "Not running {} hook in {}, container is {}",
            hook.name(),
            container.name,
            container.status.as_str()
        );
        return HookOutcome::Done;
    }
    let user = container.hook_user(hook, ctx.settings.lifecycle_uid, ctx.settings.lifecycle_gid);
    info!(
        "Running {} hook in {} container_id={}",
        hook.name(),
        container.name,
        container.id
    );
    let exec = ctx.engine.exec(
        &container.id,
        command,
        user.as_deref(),
        container.hook_timeout(hook),
    );
    let result = match hook {
        Hook::PostUpdate => ctx.wind_down(exec).await,
        _ => ctx.interruptible(exec).await,
    };
    let outcome = match result {
        Ok(0) => HookOutcome::Done,
        Err(EngineError::Cancelled) => {
            info!(
                "{} hook in {} interrupted by shutdown",
                hook.name(),
                container.name
            );
            return HookOutcome::Cancelled;
        }
        Ok(EX_TEMPFAIL) if hook == Hook::PreUpdate => HookOutcome::Skip,
        Ok(code) => HookOutcome::Failed(format!("{} exited with {code}", hook.name())),
        Err(e) => HookOutcome::Failed(format!("{}: {e}", hook.name())),
    };
    match outcome {
        HookOutcome::Failed(reason) if container.hook_advisory(hook) => {
            warn!(
                "Ignoring failed advisory hook in {} container_id={}: {reason}",
                container.name, container.id
            );
            HookOutcome::Done
        }
        outcome => outcome,
    }
}

/// Session-wide pre-check and post-check hooks; failures are only logged.
pub async fn run_session(ctx: &Context, containers: &[Container], hook: Hook) {
    for container in containers {
        if let HookOutcome::Failed(reason) = run(ctx, container, hook).await {
            warn!(
                "Hook failed in {} container_id={}: {reason}",
                container.name, container.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::{HookOutcome, run};
    use crate::{
        container::{Hook, tests::container},
        engine::ContainerStatus,
        settings::Settings,
        update::{
            Context,
            testing::{Event, FakeEngine, FakeProbe},
        },
    };

    fn context(lifecycle_hooks: bool, engine: Arc<FakeEngine>) -> Context {
        Context {
            settings: Arc::new(Settings {
                lifecycle_hooks,
                ..Default::default()
            }),
            engine,
            probe: Arc::new(FakeProbe::default()),
            token: CancellationToken::new(),
        }
    }

    const PRE_UPDATE: &str = "com.centurylinklabs.watchtower.lifecycle.pre-update";
    const POST_UPDATE: &str = "com.centurylinklabs.watchtower.lifecycle.post-update";
    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn disabled_hooks_do_nothing() {
        let engine = Arc::new(FakeEngine::default());
        let web = container("web", "nginx", "sha256:a").with_label(PRE_UPDATE, "/backup.sh");
        engine.add(web.clone());

        let outcome = run(&context(false, engine.clone()), &web, Hook::PreUpdate).await;
        assert_eq!(outcome, HookOutcome::Done);
        assert!(engine.events().is_empty());
    }

    #[tokio::test]
    async fn exit_codes() {
        let engine = Arc::new(FakeEngine::default());
        let web = container("web", "nginx", "sha256:a").with_label(PRE_UPDATE, "/backup.sh");
        engine.add(web.clone());
        let ctx = context(true, engine.clone());

        assert_eq!(run(&ctx, &web, Hook::PreUpdate).await, HookOutcome::Done);
        assert_eq!(
            engine.events(),
            vec![Event::Exec("web".to_string(), "/backup.sh".to_string())]
        );

        engine.exit_code("/backup.sh", 75);
        assert_eq!(run(&ctx, &web, Hook::PreUpdate).await, HookOutcome::Skip);

        engine.exit_code("/backup.sh", 1);
        assert!(matches!(
            run(&ctx, &web, Hook::PreUpdate).await,
            HookOutcome::Failed(_)
        ));

        let advisory = web.with_label(
            "com.centurylinklabs.watchtower.lifecycle.pre-update-advisory",
            "true",
        );
        assert_eq!(run(&ctx, &advisory, Hook::PreUpdate).await, HookOutcome::Done);
    }

    #[tokio::test]
    async fn skips_stopped_containers() {
        let engine = Arc::new(FakeEngine::default());
        let mut web = container("web", "nginx", "sha256:a").with_label(PRE_UPDATE, "/backup.sh");
        web.status = ContainerStatus::Exited;
        engine.add(web.clone());

        assert_eq!(
            run(&context(true, engine.clone()), &web, Hook::PreUpdate).await,
            HookOutcome::Done
        );
        assert!(engine.events().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_unbounded_hook() {
        let engine = Arc::new(FakeEngine::default());
        engine.exec_delay(HOUR);
        let web = container("web", "nginx", "sha256:a")
            .with_label(PRE_UPDATE, "/backup.sh")
            .with_label(
                "com.centurylinklabs.watchtower.lifecycle.pre-update-timeout",
                "0",
            );
        engine.add(web.clone());
        let ctx = context(true, engine);
        ctx.token.cancel();

        let outcome =
            tokio::time::timeout(Duration::from_secs(5), run(&ctx, &web, Hook::PreUpdate))
                .await
                .unwrap();
        assert_eq!(outcome, HookOutcome::Cancelled);
    }

    #[tokio::test]
    async fn post_update_hook_gets_a_bounded_grace() {
        let engine = Arc::new(FakeEngine::default());
        engine.exec_delay(HOUR);
        let web = container("web", "nginx", "sha256:a")
            .with_label(POST_UPDATE, "/warmup.sh")
            .with_label(
                "com.centurylinklabs.watchtower.lifecycle.post-update-timeout",
                "0",
            );
        engine.add(web.clone());
        let ctx = Context {
            settings: Arc::new(Settings {
                lifecycle_hooks: true,
                engine_timeout: Duration::from_millis(50),
                ..Default::default()
            }),
            engine,
            probe: Arc::new(FakeProbe::default()),
            token: CancellationToken::new(),
        };
        ctx.token.cancel();

        let outcome =
            tokio::time::timeout(Duration::from_secs(5), run(&ctx, &web, Hook::PostUpdate))
                .await
                .unwrap();
        assert!(matches!(outcome, HookOutcome::Failed(_)));
    }
}
