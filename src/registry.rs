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

use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use log::debug;
use oci_client::{
    Client, Reference,
    client::{ClientConfig, ClientProtocol},
    secrets::RegistryAuth,
};
use serde::Deserialize;

const DEFAULT_TAG: &str = "latest";
const DEFAULT_REGISTRY: &str = "docker.io";
const WELL_KNOWN_REGISTRIES: [&str; 3] = ["docker.io", "index.docker.io", "ghcr.io"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Deserialize)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl AuthEntry {
    fn credentials(self) -> Result<Option<Credentials>> {
        if let (Some(username), Some(password)) = (self.username, self.password) {
            return Ok(Some(Credentials { username, password }));
        }
        let Some(auth) = self.auth.filter(|auth| !auth.is_empty()) else {
            return Ok(None);
        };
        let decoded = String::from_utf8(STANDARD.decode(auth.trim())?)?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| anyhow!("auth entry is not user:password"))?;
        Ok(Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }
}

/// Normalises a config key or reference host to a bare registry host.
fn registry_host(key: &str) -> String {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key);
    match host {
        "index.docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY.to_string(),
        host => host.to_string(),
    }
}

/// Host of the registry serving `image`.
pub fn registry_of(image: &str) -> String {
    match with_default_tag(image).parse::<Reference>() {
        Ok(reference) => registry_host(reference.registry()),
        Err(_) => DEFAULT_REGISTRY.to_string(),
    }
}

/// Registry credentials selected by host.
///
/// Entries come from the engine's `config.json`; the `--repo-user` pair only
/// answers for hosts the file does not name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialStore {
    hosts: HashMap<String, Credentials>,
    fallback: Option<Credentials>,
}

impl CredentialStore {
    pub fn new(fallback: Option<Credentials>) -> CredentialStore {
        CredentialStore {
            hosts: HashMap::new(),
            fallback,
        }
    }

    /// Reads the `auths` section of a Docker client config; a missing file is empty.
    pub fn load(path: &Path, fallback: Option<Credentials>) -> Result<CredentialStore> {
        let mut store = CredentialStore::new(fallback);
        if !path.is_file() {
            debug!("No registry config at {}", path.display());
            return Ok(store);
        }
        let content = std::fs::read_to_string(path)?;
        store
            .extend(&content)
            .with_context(|| format!("Cannot read registry config {}", path.display()))?;
        Ok(store)
    }

    fn extend(&mut self, content: &str) -> Result<()> {
        let config: DockerConfig = serde_json::from_str(content)?;
        for (key, entry) in config.auths {
            if let Some(credentials) = entry.credentials()? {
                self.hosts.insert(registry_host(&key), credentials);
            }
        }
        Ok(())
    }

    pub fn for_image(&self, image: &str) -> Option<&Credentials> {
        self.hosts
            .get(&registry_of(image))
            .or(self.fallback.as_ref())
    }
}

/// Appends the default tag unless the reference carries a tag or a digest.
pub fn with_default_tag(image: &str) -> String {
    if image.contains('@') {
        return image.to_string();
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    if image[name_start..].contains(':') {
        image.to_string()
    } else {
        format!("{image}:{DEFAULT_TAG}")
    }
}

/// Short form used to compare references written in different styles.
pub fn canonical(image: &str) -> String {
    let image = with_default_tag(image);
    for prefix in [
        "docker.io/library/",
        "index.docker.io/library/",
        "docker.io/",
        "index.docker.io/",
    ] {
        if let Some(short) = image.strip_prefix(prefix) {
            return short.to_string();
        }
    }
    image
}

pub fn same_image(a: &str, b: &str) -> bool {
    canonical(a) == canonical(b)
}

pub fn is_well_known_registry(image: &str) -> bool {
    match image.parse::<Reference>() {
        Ok(reference) => WELL_KNOWN_REGISTRIES.contains(&reference.registry()),
        Err(_) => false,
    }
}

/// Whether any of an image's repo digests carries `digest`.
pub fn has_digest(repo_digests: &[String], digest: &str) -> bool {
    repo_digests
        .iter()
        .any(|repo_digest| repo_digest.rsplit_once('@').is_some_and(|(_, d)| d == digest))
}

#[async_trait]
pub trait RegistryProbe: Send + Sync {
    /// Digest the registry currently advertises for `image`.
    async fn manifest_digest(&self, image: &str) -> Result<String>;
}

pub struct OciProbe {
    client: Client,
    credentials: CredentialStore,
}

impl OciProbe {
    pub fn new(credentials: CredentialStore) -> OciProbe {
        let client_config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        OciProbe {
            client: Client::new(client_config),
            credentials,
        }
    }

    fn auth(&self, image: &str) -> RegistryAuth {
        match self.credentials.for_image(image) {
            Some(c) => RegistryAuth::Basic(c.username.clone(), c.password.clone()),
            None => RegistryAuth::Anonymous,
        }
    }
}

#[async_trait]
impl RegistryProbe for OciProbe {
    async fn manifest_digest(&self, image: &str) -> Result<String> {
        let reference = with_default_tag(image).parse::<Reference>()?;
        let digest = self
            .client
            .fetch_manifest_digest(&reference, &self.auth(image))
            .await?;
        Ok(digest)
    }
}
