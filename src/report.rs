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

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::{
    container::Container,
    error::{ContainerError, ErrorKind, SessionError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Fresh,
    /// Stale, but left to another code path (self-update).
    Stale,
    Updated,
    /// Fresh, re-created because a dependency was updated.
    Restarted,
    Failed,
    Skipped,
    MonitorOnlyStale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: String,
    pub name: String,
    pub image: String,
    pub current_image_id: String,
    pub latest_image_id: Option<String>,
    pub new_container_id: Option<String>,
    pub outcome: Outcome,
    pub kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl Entry {
    pub fn new(container: &Container, outcome: Outcome) -> Entry {
        Entry {
            id: container.id.clone(),
            name: container.name.clone(),
            image: container.image_name().to_string(),
            current_image_id: container.image_id.clone(),
            latest_image_id: None,
            new_container_id: None,
            outcome,
            kind: None,
            error: None,
        }
    }

    pub fn failed(container: &Container, error: &ContainerError) -> Entry {
        Entry {
            kind: Some(error.kind()),
            error: Some(error.to_string()),
            ..Entry::new(container, Outcome::Failed)
        }
    }

    pub fn skipped(container: &Container, kind: ErrorKind) -> Entry {
        Entry {
            kind: Some(kind),
            ..Entry::new(container, Outcome::Skipped)
        }
    }

    pub fn latest(self, latest_image_id: Option<String>) -> Entry {
        Entry {
            latest_image_id,
            ..self
        }
    }

    pub fn is_stale(&self) -> bool {
        self.latest_image_id
            .as_ref()
            .is_some_and(|latest| *latest != self.current_image_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("container {0} already has a report entry")]
pub struct DuplicateEntry(pub String);

/// Append-only accumulator for one session.
pub struct ReportBuilder {
    entries: Vec<Entry>,
    seen: HashSet<String>,
    failure: Option<SessionError>,
    started: Instant,
    timestamp: OffsetDateTime,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        ReportBuilder {
            entries: Vec::new(),
            seen: HashSet::new(),
            failure: None,
            started: Instant::now(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

impl ReportBuilder {
    pub fn record(&mut self, entry: Entry) -> Result<(), DuplicateEntry> {
        if !self.seen.insert(entry.id.clone()) {
            return Err(DuplicateEntry(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn fail(&mut self, error: SessionError) {
        self.failure = Some(error);
    }

    pub fn finish(self) -> Report {
        Report {
            entries: self.entries,
            failure: self.failure,
            duration: self.started.elapsed(),
            timestamp: self.timestamp,
        }
    }
}

/// Immutable outcome of one session.
#[derive(Debug, Clone)]
pub struct Report {
    entries: Vec<Entry>,
    failure: Option<SessionError>,
    duration: Duration,
    timestamp: OffsetDateTime,
}

impl Report {
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    fn with(&self, outcome: Outcome) -> Vec<&Entry> {
        self.entries.iter().filter(|e| e.outcome == outcome).collect()
    }

    pub fn scanned(&self) -> Vec<&Entry> {
        self.entries.iter().collect()
    }

    pub fn fresh(&self) -> Vec<&Entry> {
        self.with(Outcome::Fresh)
    }

    pub fn stale(&self) -> Vec<&Entry> {
        self.entries.iter().filter(|e| e.is_stale()).collect()
    }

    pub fn updated(&self) -> Vec<&Entry> {
        self.with(Outcome::Updated)
    }

    pub fn restarted(&self) -> Vec<&Entry> {
        self.with(Outcome::Restarted)
    }

    pub fn failed(&self) -> Vec<&Entry> {
        self.with(Outcome::Failed)
    }

    pub fn skipped(&self) -> Vec<&Entry> {
        self.with(Outcome::Skipped)
    }

    pub fn monitor_only_stale(&self) -> Vec<&Entry> {
        self.with(Outcome::MonitorOnlyStale)
    }

    pub fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn summary(&self) -> Summary {
        Summary {
            scanned: self.entries.len(),
            updated: self.updated().len(),
            failed: self.failed().len(),
            restarted: self.restarted().len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub scanned: usize,
    pub updated: usize,
    pub failed: usize,
    pub restarted: usize,
}
