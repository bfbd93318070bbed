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

use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{error::SessionError, settings::parse_duration, update::Supervisor};

/// When sessions fire. Immutable once parsed.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
    Every(Duration),
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Schedule::Cron { expression: a, .. }, Schedule::Cron { expression: b, .. }) => a == b,
            (Schedule::Every(a), Schedule::Every(b)) => a == b,
            _ => false,
        }
    }
}

impl Schedule {
    /// Accepts 5-field and 6-field (with seconds) cron expressions, the
    /// `@hourly`-style macros and `@every <duration>`.
    pub fn parse(expression: &str) -> Result<Schedule, SessionError> {
        let expression = expression.trim();
        if let Some(every) = expression.strip_prefix("@every") {
            let interval = parse_duration(every)
                .map_err(|e| SessionError::InvalidSchedule(format!("{expression}: {e}")))?;
            if interval.is_zero() {
                return Err(SessionError::InvalidSchedule(format!(
                    "{expression}: interval must be positive"
                )));
            }
            return Ok(Schedule::Every(interval));
        }
        let normalized = match expression.split_whitespace().count() {
            5 => format!("0 {expression}"),
            _ => expression.to_string(),
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| SessionError::InvalidSchedule(format!("{expression}: {e}")))?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { schedule, .. } => schedule.after(&now).next(),
            Schedule::Every(interval) => Some(now + chrono::Duration::from_std(*interval).ok()?),
        }
    }

    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

pub struct Scheduler {
    schedule: Schedule,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
    update_on_start: bool,
}

impl Scheduler {
    pub fn new(
        schedule: Schedule,
        supervisor: Arc<Supervisor>,
        shutdown: CancellationToken,
        update_on_start: bool,
    ) -> Scheduler {
        Scheduler {
            schedule,
            supervisor,
            shutdown,
            update_on_start,
        }
    }

    /// Fires sessions until shutdown, then waits for a running one to finish.
    pub async fn run(self) {
        if self.update_on_start {
            self.fire().await;
        }
        while !self.shutdown.is_cancelled() {
            let Some(wait) = self.schedule.until_next(Utc::now()) else {
                warn!("Schedule has no upcoming runs");
                break;
            };
            info!("Next scheduled update in {}s", wait.as_secs());
            tokio::select! {
                () = tokio::time::sleep(wait) => self.fire().await,
                () = self.shutdown.cancelled() => break,
            }
        }
        if !self.supervisor.lock().is_free() {
            info!("Scheduler stopping, waiting for running update to finish");
        }
        let _guard = self.supervisor.lock().acquire().await;
    }

    async fn fire(&self) {
        if self.supervisor.try_update().await.is_err() {
            info!("Skipping scheduled update, an update is already running");
            self.supervisor.metrics().record_skipped();
        }
    }
}
