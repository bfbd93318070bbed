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

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};

use crate::report::Report;

/// A destination for session reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, report: &Report) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes reports to the log.
pub struct LogNotifier {
    split_by_container: bool,
}

impl LogNotifier {
    pub fn new(split_by_container: bool) -> LogNotifier {
        LogNotifier { split_by_container }
    }

    pub fn messages(&self, report: &Report) -> Vec<String> {
        let mut messages = Vec::new();
        if let Some(failure) = report.failure() {
            messages.push(format!(
                "Update session failed: kind={} {failure}",
                failure.kind()
            ));
            return messages;
        }
        if self.split_by_container {
            for entry in report.updated() {
                messages.push(format!(
                    "Updated {} ({}) container_id={} image={} -> {}",
                    entry.name,
                    entry.image,
                    entry.id,
                    entry.current_image_id,
                    entry.latest_image_id.as_deref().unwrap_or("?"),
                ));
            }
        }
        let summary = report.summary();
        let mut line = format!(
            "Session done: scanned={} updated={} failed={} restarted={} fresh={} skipped={} monitored={}",
            summary.scanned,
            summary.updated,
            summary.failed,
            summary.restarted,
            report.fresh().len(),
            report.skipped().len(),
            report.monitor_only_stale().len(),
        );
        for entry in report.failed() {
            line.push_str(&format!(
                "\n  failed {} kind={} {}",
                entry.name,
                entry.kind.map(|k| k.to_string()).unwrap_or_default(),
                entry.error.as_deref().unwrap_or_default()
            ));
        }
        for entry in report.monitor_only_stale() {
            line.push_str(&format!("\n  stale {} image={}", entry.name, entry.image));
        }
        messages.push(line);
        messages
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, report: &Report) -> Result<()> {
        for message in self.messages(report) {
            if report.failure().is_some() || !report.failed().is_empty() {
                warn!("{message}");
            } else {
                info!("{message}");
            }
        }
        Ok(())
    }
}
