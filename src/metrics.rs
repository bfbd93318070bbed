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

use std::sync::Arc;

use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

use crate::report::Report;

/// Session counters shared by the scheduler and the HTTP API.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    scanned: Gauge,
    updated: Gauge,
    failed: Gauge,
    scans: Counter,
    skipped: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        let mut registry = Registry::default();
        let scanned = Gauge::default();
        let updated = Gauge::default();
        let failed = Gauge::default();
        let scans = Counter::default();
        let skipped = Counter::default();
        registry.register(
            "watchtower_containers_scanned",
            "Number of containers scanned for changes by watchtower during the last scan",
            scanned.clone(),
        );
        registry.register(
            "watchtower_containers_updated",
            "Number of containers updated by watchtower during the last scan",
            updated.clone(),
        );
        registry.register(
            "watchtower_containers_failed",
            "Number of containers where update failed during the last scan",
            failed.clone(),
        );
        registry.register(
            "watchtower_scans",
            "Number of scans since the watchtower started",
            scans.clone(),
        );
        registry.register(
            "watchtower_scans_skipped",
            "Number of skipped scans since watchtower started",
            skipped.clone(),
        );
        Metrics {
            registry: Arc::new(registry),
            scanned,
            updated,
            failed,
            scans,
            skipped,
        }
    }

    pub fn record(&self, report: &Report) {
        let summary = report.summary();
        self.scanned.set(summary.scanned as i64);
        self.updated.set(summary.updated as i64);
        self.failed.set(summary.failed as i64);
        self.scans.inc();
    }

    pub fn record_skipped(&self) {
        self.skipped.inc();
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;
    use crate::{
        container::tests::container,
        report::{Entry, Outcome, ReportBuilder},
    };

    #[test]
    fn exposes_last_session() {
        let metrics = Metrics::new();
        let mut builder = ReportBuilder::default();
        builder
            .record(Entry::new(
                &container("web", "nginx", "sha256:a"),
                Outcome::Updated,
            ))
            .unwrap();
        builder
            .record(Entry::new(
                &container("db", "postgres", "sha256:b"),
                Outcome::Fresh,
            ))
            .unwrap();
        metrics.record(&builder.finish());
        metrics.record_skipped();

        let text = metrics.encode().unwrap();
        assert!(text.contains("watchtower_containers_scanned 2"));
        assert!(text.contains("watchtower_containers_updated 1"));
        assert!(text.contains("watchtower_containers_failed 0"));
        assert!(text.contains("watchtower_scans_total 1"));
        assert!(text.contains("watchtower_scans_skipped_total 1"));
    }
}
