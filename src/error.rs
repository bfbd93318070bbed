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

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Per-container failure and informational kinds as they appear in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ImageUnresolvable,
    PullFailed,
    StopFailed,
    RemoveFailed,
    CreateFailed,
    StartFailed,
    PreHookFailed,
    PostHookFailed,
    DependencyCycle,
    Cancelled,
    MonitorOnlyStale,
    SelfUpdateDisabled,
    PreHookSkipped,
    RollingAborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("image cannot be resolved: {0}")]
    ImageUnresolvable(String),
    #[error("pull failed: {0}")]
    PullFailed(String),
    #[error("stop failed: {0}")]
    StopFailed(String),
    #[error("remove failed: {0}")]
    RemoveFailed(String),
    #[error("create failed: {0}")]
    CreateFailed(String),
    #[error("start failed: {0}")]
    StartFailed(String),
    #[error("pre-update hook failed: {0}")]
    PreHookFailed(String),
    #[error("post-update hook failed: {0}")]
    PostHookFailed(String),
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
    #[error("cancelled")]
    Cancelled,
}

impl ContainerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContainerError::ImageUnresolvable(_) => ErrorKind::ImageUnresolvable,
            ContainerError::PullFailed(_) => ErrorKind::PullFailed,
            ContainerError::StopFailed(_) => ErrorKind::StopFailed,
            ContainerError::RemoveFailed(_) => ErrorKind::RemoveFailed,
            ContainerError::CreateFailed(_) => ErrorKind::CreateFailed,
            ContainerError::StartFailed(_) => ErrorKind::StartFailed,
            ContainerError::PreHookFailed(_) => ErrorKind::PreHookFailed,
            ContainerError::PostHookFailed(_) => ErrorKind::PostHookFailed,
            ContainerError::DependencyCycle(_) => ErrorKind::DependencyCycle,
            ContainerError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Failures that abort a whole session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("container engine unreachable: {0}")]
    EngineUnreachable(String),
    #[error("multiple watchtower instances: {0}")]
    MultipleInstances(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("container discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("update session aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::EngineUnreachable(_) => "EngineUnreachable",
            SessionError::MultipleInstances(_) => "MultipleInstances",
            SessionError::InvalidSchedule(_) => "InvalidSchedule",
            SessionError::DiscoveryFailed(_) => "DiscoveryFailed",
            SessionError::Aborted(_) => "Aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContainerError, ErrorKind, SessionError};

    #[test]
    fn container_error_kinds() {
        assert_eq!(
            ContainerError::StopFailed("timeout".to_string()).kind(),
            ErrorKind::StopFailed
        );
        assert_eq!(ContainerError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(ErrorKind::DependencyCycle.to_string(), "DependencyCycle");
    }

    #[test]
    fn session_error_kind_names() {
        let error = SessionError::MultipleInstances("2 instances in scope prod".to_string());
        assert_eq!(error.kind(), "MultipleInstances");
        assert_eq!(
            error.to_string(),
            "multiple watchtower instances: 2 instances in scope prod"
        );
    }
}
