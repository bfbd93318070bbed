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

use crate::{container::Container, registry::same_image, settings::Settings};

/// Predicate deciding which containers a session may look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    names: Vec<String>,
    disabled: Vec<String>,
    enable_label_only: bool,
    scope: Option<String>,
    images: Vec<String>,
}

fn trimmed(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.trim().trim_start_matches('/').to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

impl Filter {
    pub fn new(settings: &Settings) -> Filter {
        Filter {
            names: trimmed(&settings.names),
            disabled: trimmed(&settings.disabled),
            enable_label_only: settings.label_enable,
            scope: settings.scope.clone(),
            images: Vec::new(),
        }
    }

    /// Restricts the filter to containers running one of `images`.
    pub fn with_images(self, images: Vec<String>) -> Filter {
        Filter { images, ..self }
    }

    pub fn admits(&self, container: &Container) -> bool {
        let enabled = match container.enabled() {
            Some(enabled) => enabled,
            None => !self.enable_label_only,
        };
        if !enabled {
            return false;
        }
        if container.scope() != self.scope.as_deref() {
            return false;
        }
        if !self.names.is_empty() && !self.names.iter().any(|n| *n == container.name) {
            return false;
        }
        if self.disabled.iter().any(|n| *n == container.name) {
            return false;
        }
        self.images.is_empty()
            || self
                .images
                .iter()
                .any(|image| same_image(image, container.image_name()))
    }
}
