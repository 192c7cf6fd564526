use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Identity, IdentityId};

use super::http::join_url;

pub const MANIFEST_PATH: &str = "/api/faces/manifest";

/// Labeled reference images served by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReferenceManifest {
    #[serde(default)]
    pub people: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default)]
    pub student_id: Option<String>,
    /// Storage folder; doubles as the identity key when no id is given.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl ManifestEntry {
    pub fn identity(&self) -> Identity {
        let id = self
            .student_id
            .as_deref()
            .or(self.folder.as_deref())
            .filter(|id| !id.trim().is_empty())
            .map(IdentityId::new)
            .unwrap_or_else(|| IdentityId::from_display_name(&self.name));

        Identity {
            id,
            display_name: self.name.clone(),
        }
    }
}

/// Where reference image bytes come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>>;
}

pub struct ManifestClient {
    client: reqwest::Client,
    base_url: String,
}

impl ManifestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build manifest HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch_manifest(&self) -> Result<ReferenceManifest> {
        let url = join_url(&self.base_url, MANIFEST_PATH);
        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch reference manifest from {url}"))?
            .error_for_status()
            .context("reference manifest request rejected")?
            .json()
            .await
            .context("malformed reference manifest")
    }

    fn resolve(&self, locator: &str) -> String {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            locator.to_string()
        } else {
            join_url(&self.base_url, locator)
        }
    }
}

#[async_trait]
impl ImageSource for ManifestClient {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        let url = self.resolve(locator);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch reference image {url}"))?
            .error_for_status()
            .with_context(|| format!("reference image {url} unavailable"))?
            .bytes()
            .await
            .with_context(|| format!("failed to read reference image {url}"))?;
        Ok(bytes.to_vec())
    }
}
