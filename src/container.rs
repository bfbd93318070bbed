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

use bollard::models::{ContainerConfig, EndpointSettings, HostConfig};
use clap::ValueEnum;
use log::warn;

use crate::{
    engine::{ContainerStatus, CreateSpec, ImageRecord},
    settings::Settings,
};

const LABEL_PREFIX: &str = "com.centurylinklabs.watchtower";
pub const SUPERVISOR_LABEL: &str = "com.centurylinklabs.watchtower";
pub const ENABLE_LABEL: &str = "com.centurylinklabs.watchtower.enable";
pub const SCOPE_LABEL: &str = "com.centurylinklabs.watchtower.scope";
pub const DEPENDS_ON_LABEL: &str = "com.centurylinklabs.watchtower.depends-on";
pub const MONITOR_ONLY_LABEL: &str = "com.centurylinklabs.watchtower.monitor-only";
pub const NO_PULL_LABEL: &str = "com.centurylinklabs.watchtower.no-pull";
pub const STOP_SIGNAL_LABEL: &str = "com.centurylinklabs.watchtower.stop-signal";

const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    PreCheck,
    PreUpdate,
    PostUpdate,
    PostCheck,
}

impl Hook {
    pub fn name(&self) -> &'static str {
        match self {
            Hook::PreCheck => "pre-check",
            Hook::PreUpdate => "pre-update",
            Hook::PostUpdate => "post-update",
            Hook::PostCheck => "post-check",
        }
    }

    fn label(&self, suffix: &str) -> String {
        format!("{LABEL_PREFIX}.lifecycle.{}{suffix}", self.name())
    }
}

/// How CPU limits are carried over to a replacement container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CpuCopyMode {
    /// Copy every CPU setting verbatim.
    Full,
    /// Copy the subset the engine accepts together.
    #[default]
    Auto,
    /// Leave CPU settings at engine defaults.
    #[value(name = "none")]
    Omit,
}

impl CpuCopyMode {
    fn apply(&self, host_config: &mut HostConfig) {
        match self {
            CpuCopyMode::Full => {}
            CpuCopyMode::Auto => {
                if host_config.nano_cpus.is_some_and(|n| n > 0) {
                    host_config.cpu_period = None;
                    host_config.cpu_quota = None;
                }
                host_config.cpu_realtime_period = None;
                host_config.cpu_realtime_runtime = None;
            }
            CpuCopyMode::Omit => {
                host_config.cpu_shares = None;
                host_config.nano_cpus = None;
                host_config.cpu_period = None;
                host_config.cpu_quota = None;
                host_config.cpu_realtime_period = None;
                host_config.cpu_realtime_runtime = None;
                host_config.cpuset_cpus = None;
                host_config.cpuset_mems = None;
            }
        }
    }
}

/// Snapshot of a container taken at discovery time.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub created: String,
    pub status: ContainerStatus,
    /// Id of the image the container is running.
    pub image_id: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: HashMap<String, EndpointSettings>,
    /// The running image, used to tell image defaults from explicit settings.
    pub image: Option<ImageRecord>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Some(true),
        "0" | "f" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Container {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// The configured image reference, e.g. `nginx:1.27`.
    pub fn image_name(&self) -> &str {
        self.config.image.as_deref().unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    fn bool_label(&self, key: &str) -> Option<bool> {
        let value = self.label(key)?;
        let parsed = parse_bool(value);
        if parsed.is_none() {
            warn!(
                "Ignoring label {key}={value} on {}: not a boolean",
                self.name
            );
        }
        parsed
    }

    pub fn enabled(&self) -> Option<bool> {
        self.bool_label(ENABLE_LABEL)
    }

    pub fn scope(&self) -> Option<&str> {
        self.label(SCOPE_LABEL).filter(|scope| !scope.is_empty())
    }

    pub fn monitor_only(&self) -> Option<bool> {
        self.bool_label(MONITOR_ONLY_LABEL)
    }

    pub fn no_pull(&self) -> Option<bool> {
        self.bool_label(NO_PULL_LABEL)
    }

    pub fn is_supervisor(&self) -> bool {
        self.bool_label(SUPERVISOR_LABEL).unwrap_or(false)
    }

    pub fn is_pinned(&self) -> bool {
        self.image_name().contains('@')
    }

    pub fn stop_signal(&self) -> &str {
        self.label(STOP_SIGNAL_LABEL)
            .or(self.config.stop_signal.as_deref())
            .filter(|signal| !signal.is_empty())
            .unwrap_or(DEFAULT_STOP_SIGNAL)
    }

    /// Names of the containers this one depends on: the depends-on label,
    /// engine links and a `container:<name>` network mode.
    pub fn links(&self) -> Vec<String> {
        let mut links: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            let name = name.trim().trim_start_matches('/');
            if !name.is_empty() && name != self.name && !links.iter().any(|l| l == name) {
                links.push(name.to_string());
            }
        };
        if let Some(depends_on) = self.label(DEPENDS_ON_LABEL) {
            depends_on.split(',').for_each(&mut push);
        }
        for link in self.host_config.links.iter().flatten() {
            if let Some((name, _)) = link.split_once(':') {
                push(name);
            }
        }
        if let Some(network) = self
            .host_config
            .network_mode
            .as_deref()
            .and_then(|mode| mode.strip_prefix("container:"))
        {
            push(network);
        }
        links
    }

    pub fn hook_command(&self, hook: Hook) -> Option<&str> {
        self.label(&hook.label(""))
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
    }

    /// `uid[:gid]` the hook runs as, from labels or the global defaults.
    pub fn hook_user(&self, hook: Hook, uid: Option<u32>, gid: Option<u32>) -> Option<String> {
        let uid = self
            .label(&hook.label("-uid"))
            .and_then(|uid| uid.trim().parse::<u32>().ok())
            .or(uid);
        let gid = self
            .label(&hook.label("-gid"))
            .and_then(|gid| gid.trim().parse::<u32>().ok())
            .or(gid);
        match (uid, gid) {
            (Some(uid), Some(gid)) => Some(format!("{uid}:{gid}")),
            (Some(uid), None) => Some(uid.to_string()),
            (None, Some(gid)) => Some(format!("0:{gid}")),
            (None, None) => None,
        }
    }

    /// Hook timeout in minutes; `0` disables the limit.
    pub fn hook_timeout(&self, hook: Hook) -> Option<Duration> {
        match self
            .label(&hook.label("-timeout"))
            .and_then(|t| t.trim().parse::<u64>().ok())
        {
            Some(0) => None,
            Some(minutes) => Some(Duration::from_secs(minutes * 60)),
            None => Some(DEFAULT_HOOK_TIMEOUT),
        }
    }

    pub fn hook_advisory(&self, hook: Hook) -> bool {
        self.bool_label(&hook.label("-advisory")).unwrap_or(false)
    }

    /// Configuration for a replacement container running `image`.
    pub fn create_spec(&self, image: &str, cpu_copy_mode: CpuCopyMode) -> CreateSpec {
        let mut config = self.config.clone();
        if let Some(image_config) = self.image.as_ref().and_then(|i| i.config.as_ref()) {
            strip_image_defaults(&mut config, image_config);
        }
        let network_mode = self.host_config.network_mode.as_deref().unwrap_or_default();
        let shared_network = network_mode.starts_with("container:");
        if shared_network || config.hostname.as_deref() == Some(self.short_id()) {
            config.hostname = None;
        }
        config.image = Some(image.to_string());

        let mut host_config = self.host_config.clone();
        host_config.links = host_config.links.map(|links| {
            links
                .iter()
                .filter_map(|link| {
                    let (name, alias) = link.split_once(':')?;
                    let alias = alias.rsplit('/').next().unwrap_or(alias);
                    Some(format!("{}:{alias}", name.trim_start_matches('/')))
                })
                .collect()
        });
        cpu_copy_mode.apply(&mut host_config);

        let networks = if shared_network || network_mode == "host" || network_mode == "none" {
            Vec::new()
        } else {
            self.endpoints(network_mode)
        };

        CreateSpec {
            name: self.name.clone(),
            config,
            host_config,
            networks,
        }
    }

    fn endpoints(&self, primary: &str) -> Vec<(String, EndpointSettings)> {
        let mut networks: Vec<(String, EndpointSettings)> = self
            .networks
            .iter()
            .map(|(name, endpoint)| {
                let aliases = endpoint.aliases.as_ref().map(|aliases| {
                    aliases
                        .iter()
                        .filter(|alias| alias.as_str() != self.short_id())
                        .cloned()
                        .collect()
                });
                let endpoint = EndpointSettings {
                    ipam_config: endpoint.ipam_config.clone(),
                    links: endpoint.links.clone(),
                    aliases,
                    driver_opts: endpoint.driver_opts.clone(),
                    ..Default::default()
                };
                (name.clone(), endpoint)
            })
            .collect();
        networks.sort_by(|(a, _), (b, _)| (a != primary).cmp(&(b != primary)).then(a.cmp(b)));
        networks
    }
}

fn strip_image_defaults(config: &mut ContainerConfig, image: &ContainerConfig) {
    if config.working_dir == image.working_dir {
        config.working_dir = None;
    }
    if config.user == image.user {
        config.user = None;
    }
    if config.cmd == image.cmd {
        config.cmd = None;
    }
    if config.entrypoint == image.entrypoint {
        config.entrypoint = None;
    }
    if config.healthcheck == image.healthcheck {
        config.healthcheck = None;
    }
    if let (Some(env), Some(image_env)) = (config.env.as_mut(), image.env.as_ref()) {
        env.retain(|e| !image_env.contains(e));
    }
    if let (Some(labels), Some(image_labels)) = (config.labels.as_mut(), image.labels.as_ref()) {
        labels.retain(|key, value| image_labels.get(key) != Some(value));
    }
    if let (Some(volumes), Some(image_volumes)) = (config.volumes.as_mut(), image.volumes.as_ref())
    {
        volumes.retain(|path, _| !image_volumes.contains_key(path));
    }
    if let (Some(ports), Some(image_ports)) =
        (config.exposed_ports.as_mut(), image.exposed_ports.as_ref())
    {
        ports.retain(|port, _| !image_ports.contains_key(port));
    }
}

/// Global flags combined with a container's labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policy {
    pub monitor_only: bool,
    pub no_pull: bool,
}

fn resolve(global: bool, label: Option<bool>, label_precedence: bool) -> bool {
    match label {
        None => global,
        Some(label) if label_precedence => label,
        Some(label) => global || label,
    }
}

impl Policy {
    pub fn effective(settings: &Settings, container: &Container) -> Policy {
        Policy {
            monitor_only: resolve(
                settings.monitor_only,
                container.monitor_only(),
                settings.label_precedence,
            ),
            no_pull: resolve(
                settings.no_pull,
                container.no_pull(),
                settings.label_precedence,
            ),
        }
    }
}
