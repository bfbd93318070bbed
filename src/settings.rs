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

use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};

use crate::{container::CpuCopyMode, registry::{CredentialStore, Credentials}, schedule::Schedule};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WarnOnHeadFailure {
    Always,
    #[default]
    Auto,
    Never,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Only watch these containers
    pub names: Vec<String>,

    /// Cron expression (5 or 6 fields, or @every <duration>)
    #[arg(short, long, env = "WATCHTOWER_SCHEDULE", conflicts_with = "interval")]
    pub schedule: Option<String>,

    /// Poll interval in seconds
    #[arg(short, long, env = "WATCHTOWER_POLL_INTERVAL")]
    pub interval: Option<u64>,

    /// Run a single update and exit
    #[arg(short = 'R', long, env = "WATCHTOWER_RUN_ONCE")]
    pub run_once: bool,

    /// Run an update before the first scheduled one
    #[arg(long, env = "WATCHTOWER_UPDATE_ON_START")]
    pub update_on_start: bool,

    /// Remove old images after updating
    #[arg(short, long, env = "WATCHTOWER_CLEANUP")]
    pub cleanup: bool,

    /// Do not restart updated containers
    #[arg(long, env = "WATCHTOWER_NO_RESTART")]
    pub no_restart: bool,

    /// Do not pull images, only compare with local ones
    #[arg(long, env = "WATCHTOWER_NO_PULL")]
    pub no_pull: bool,

    /// Only report stale containers
    #[arg(short, long, env = "WATCHTOWER_MONITOR_ONLY")]
    pub monitor_only: bool,

    /// Restart containers one at a time
    #[arg(long, env = "WATCHTOWER_ROLLING_RESTART")]
    pub rolling_restart: bool,

    /// Run lifecycle hook commands from container labels
    #[arg(long, env = "WATCHTOWER_LIFECYCLE_HOOKS")]
    pub enable_lifecycle_hooks: bool,

    /// Also update created and exited containers
    #[arg(short = 'S', long, env = "WATCHTOWER_INCLUDE_STOPPED")]
    pub include_stopped: bool,

    /// Also update restarting containers
    #[arg(long, env = "WATCHTOWER_INCLUDE_RESTARTING")]
    pub include_restarting: bool,

    /// Start updated containers that were stopped
    #[arg(long, env = "WATCHTOWER_REVIVE_STOPPED")]
    pub revive_stopped: bool,

    /// Remove anonymous volumes together with old containers
    #[arg(long, env = "WATCHTOWER_REMOVE_VOLUMES")]
    pub remove_volumes: bool,

    /// Only watch containers with the enable label set to true
    #[arg(short = 'e', long, env = "WATCHTOWER_LABEL_ENABLE")]
    pub label_enable: bool,

    /// Container labels override global flags
    #[arg(long, env = "WATCHTOWER_LABEL_TAKE_PRECEDENCE")]
    pub label_take_precedence: bool,

    /// Only watch containers with this scope label
    #[arg(long, env = "WATCHTOWER_SCOPE")]
    pub scope: Option<String>,

    /// Never replace the watchtower container itself
    #[arg(long, env = "WATCHTOWER_NO_SELF_UPDATE")]
    pub no_self_update: bool,

    /// Comma separated container names to ignore
    #[arg(
        short = 'x',
        long,
        env = "WATCHTOWER_DISABLE_CONTAINERS",
        value_delimiter = ','
    )]
    pub disable_containers: Vec<String>,

    /// Time to wait for a container to stop or start
    #[arg(long, env = "WATCHTOWER_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub stop_timeout: Duration,

    /// How CPU limits are copied to replacement containers
    #[arg(long, env = "WATCHTOWER_CPU_COPY_MODE", value_enum, default_value_t)]
    pub cpu_copy_mode: CpuCopyMode,

    /// When to warn about failed registry digest checks
    #[arg(long, env = "WATCHTOWER_WARN_ON_HEAD_FAILURE", value_enum, default_value_t)]
    pub warn_on_head_failure: WarnOnHeadFailure,

    /// Default uid for lifecycle hooks
    #[arg(long, env = "WATCHTOWER_LIFECYCLE_UID")]
    pub lifecycle_uid: Option<u32>,

    /// Default gid for lifecycle hooks
    #[arg(long, env = "WATCHTOWER_LIFECYCLE_GID")]
    pub lifecycle_gid: Option<u32>,

    /// Registry user
    #[arg(long, env = "WATCHTOWER_REPO_USER", requires = "repo_pass")]
    pub repo_user: Option<String>,

    /// Registry password, or a file containing it
    #[arg(long, env = "WATCHTOWER_REPO_PASS", requires = "repo_user")]
    pub repo_pass: Option<String>,

    /// Directory holding the Docker client config.json with per-registry auths
    #[arg(long, env = "DOCKER_CONFIG")]
    pub docker_config: Option<PathBuf>,

    /// Enable the HTTP update endpoint
    #[arg(long, env = "WATCHTOWER_HTTP_API_UPDATE")]
    pub http_api_update: bool,

    /// Enable the HTTP metrics endpoint
    #[arg(long, env = "WATCHTOWER_HTTP_API_METRICS")]
    pub http_api_metrics: bool,

    /// Address the HTTP API listens on
    #[arg(long, env = "WATCHTOWER_HTTP_API_HOST", default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED))]
    pub http_api_host: IpAddr,

    /// Port the HTTP API listens on
    #[arg(long, env = "WATCHTOWER_HTTP_API_PORT", default_value_t = 8080)]
    pub http_api_port: u16,

    /// Bearer token for the HTTP API, or a file containing it
    #[arg(long, env = "WATCHTOWER_HTTP_API_TOKEN")]
    pub http_api_token: Option<String>,

    /// Keep polling on schedule while the HTTP update endpoint is enabled
    #[arg(long, env = "WATCHTOWER_HTTP_API_PERIODIC_POLLS")]
    pub http_api_periodic_polls: bool,

    /// Longest time a targeted HTTP update waits for a running one
    #[arg(long, env = "WATCHTOWER_HTTP_API_QUEUE_TIMEOUT", value_parser = parse_duration)]
    pub http_api_queue_timeout: Option<Duration>,

    /// Upper bound for a single engine call
    #[arg(long, env = "WATCHTOWER_ENGINE_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    pub engine_timeout: Duration,

    /// Send one notification per updated container plus a summary
    #[arg(long, env = "WATCHTOWER_NOTIFICATION_SPLIT_BY_CONTAINER")]
    pub notification_split_by_container: bool,

    /// Enable debug logging
    #[arg(short, long, env = "WATCHTOWER_DEBUG")]
    pub debug: bool,

    /// Enable trace logging
    #[arg(long, env = "WATCHTOWER_TRACE")]
    pub trace: bool,
}

impl Cli {
    pub fn log_level(&self) -> log::Level {
        if self.trace {
            log::Level::Trace
        } else if self.debug {
            log::Level::Debug
        } else {
            log::Level::Info
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    pub update: bool,
    pub metrics: bool,
    pub bind_address: SocketAddr,
    pub token: Option<String>,
    pub periodic_polls: bool,
    pub queue_timeout: Option<Duration>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            update: false,
            metrics: false,
            bind_address: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 8080),
            token: None,
            periodic_polls: false,
            queue_timeout: None,
        }
    }
}

/// Read-only configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub names: Vec<String>,
    pub disabled: Vec<String>,
    pub label_enable: bool,
    pub scope: Option<String>,
    pub cleanup: bool,
    pub no_restart: bool,
    pub no_pull: bool,
    pub monitor_only: bool,
    pub rolling_restart: bool,
    pub lifecycle_hooks: bool,
    pub include_stopped: bool,
    pub include_restarting: bool,
    pub revive_stopped: bool,
    pub remove_volumes: bool,
    pub label_precedence: bool,
    pub no_self_update: bool,
    pub stop_timeout: Duration,
    pub engine_timeout: Duration,
    pub cpu_copy_mode: CpuCopyMode,
    pub warn_on_head_failure: WarnOnHeadFailure,
    pub lifecycle_uid: Option<u32>,
    pub lifecycle_gid: Option<u32>,
    pub credentials: CredentialStore,
    pub schedule: Schedule,
    pub run_once: bool,
    pub update_on_start: bool,
    pub http: HttpSettings,
    pub split_by_container: bool,
    /// Hostname of this process, used to recognise its own container.
    pub hostname: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            names: Vec::new(),
            disabled: Vec::new(),
            label_enable: false,
            scope: None,
            cleanup: false,
            no_restart: false,
            no_pull: false,
            monitor_only: false,
            rolling_restart: false,
            lifecycle_hooks: false,
            include_stopped: false,
            include_restarting: false,
            revive_stopped: false,
            remove_volumes: false,
            label_precedence: false,
            no_self_update: false,
            stop_timeout: Duration::from_secs(10),
            engine_timeout: Duration::from_secs(5 * 60),
            cpu_copy_mode: CpuCopyMode::default(),
            warn_on_head_failure: WarnOnHeadFailure::default(),
            lifecycle_uid: None,
            lifecycle_gid: None,
            credentials: CredentialStore::default(),
            schedule: Schedule::Every(DEFAULT_POLL_INTERVAL),
            run_once: false,
            update_on_start: false,
            http: HttpSettings::default(),
            split_by_container: false,
            hostname: None,
        }
    }
}

/// Replaces a secret value with the trimmed contents of the file it names.
fn read_secret(value: String) -> Result<String> {
    let path = Path::new(&value);
    if path.is_file() {
        Ok(std::fs::read_to_string(path)?.trim().to_string())
    } else {
        Ok(value)
    }
}

/// Parses `90`, `90s`, `1h30m`, `250ms` or an ISO-8601 duration such as `PT10S`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.starts_with('P') {
        let duration = value
            .parse::<iso8601_duration::Duration>()
            .map_err(|_| anyhow::anyhow!("Cannot parse ISO-8601 duration {value}"))?;
        return duration
            .to_std()
            .ok_or_else(|| anyhow::anyhow!("Cannot convert {value} to a duration"));
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            bail!("Invalid duration {value}");
        }
        let amount: u64 = rest[..digits].parse()?;
        rest = &rest[digits..];
        let unit = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        total += match &rest[..unit] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 60 * 60),
            "d" => Duration::from_secs(amount * 24 * 60 * 60),
            unit => bail!("Invalid duration unit '{unit}' in {value}"),
        };
        rest = &rest[unit..];
    }
    Ok(total)
}

impl Settings {
    pub fn from_cli(cli: Cli) -> Result<Settings> {
        let schedule = match (&cli.schedule, cli.interval) {
            (Some(_), Some(_)) => bail!("Only one of --schedule and --interval can be used"),
            (Some(expression), None) => Schedule::parse(expression)?,
            (None, Some(seconds)) => Schedule::Every(Duration::from_secs(seconds)),
            (None, None) => Schedule::Every(DEFAULT_POLL_INTERVAL),
        };
        if cli.run_once && cli.http_api_update {
            bail!("--run-once cannot be combined with --http-api-update");
        }
        if cli.http_api_update && cli.http_api_token.is_none() {
            bail!("--http-api-update requires --http-api-token");
        }
        let fallback = match (cli.repo_user, cli.repo_pass) {
            (Some(username), Some(password)) => Some(Credentials {
                username,
                password: read_secret(password)?,
            }),
            _ => None,
        };
        let config_dir = cli
            .docker_config
            .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".docker")))
            .unwrap_or_else(|| PathBuf::from("/"));
        let credentials = CredentialStore::load(&config_dir.join("config.json"), fallback)?;
        let token = cli.http_api_token.map(read_secret).transpose()?;
        Ok(Settings {
            names: cli.names,
            disabled: cli.disable_containers,
            label_enable: cli.label_enable,
            scope: cli.scope.filter(|scope| !scope.is_empty()),
            cleanup: cli.cleanup,
            no_restart: cli.no_restart,
            no_pull: cli.no_pull,
            monitor_only: cli.monitor_only,
            rolling_restart: cli.rolling_restart,
            lifecycle_hooks: cli.enable_lifecycle_hooks,
            include_stopped: cli.include_stopped,
            include_restarting: cli.include_restarting,
            revive_stopped: cli.revive_stopped,
            remove_volumes: cli.remove_volumes,
            label_precedence: cli.label_take_precedence,
            no_self_update: cli.no_self_update,
            stop_timeout: cli.stop_timeout,
            engine_timeout: cli.engine_timeout,
            cpu_copy_mode: cli.cpu_copy_mode,
            warn_on_head_failure: cli.warn_on_head_failure,
            lifecycle_uid: cli.lifecycle_uid,
            lifecycle_gid: cli.lifecycle_gid,
            credentials,
            schedule,
            run_once: cli.run_once,
            update_on_start: cli.update_on_start,
            http: HttpSettings {
                update: cli.http_api_update,
                metrics: cli.http_api_metrics,
                bind_address: SocketAddr::new(cli.http_api_host, cli.http_api_port),
                token,
                periodic_polls: cli.http_api_periodic_polls,
                queue_timeout: cli.http_api_queue_timeout,
            },
            split_by_container: cli.notification_split_by_container,
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
        })
    }

    /// Whether the scheduler should fire periodically.
    pub fn periodic_polls(&self) -> bool {
        !self.http.update || self.http.periodic_polls
    }
}
