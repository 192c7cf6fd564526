//! In-process nearest-neighbour matching against enrolled descriptors.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::models::{Frame, Identity, MatchResult, MatchScore, SessionId};

use super::{
    embedder::{euclidean_distance, Descriptor, FaceEmbedder},
    health::{BackendHealth, HealthIndicator},
    manifest::{ImageSource, ManifestClient, ReferenceManifest},
    Recognizer,
};

#[derive(Debug, Clone)]
struct ReferenceEntry {
    identity: Identity,
    descriptors: Vec<Descriptor>,
}

/// Immutable descriptor set. Enumeration order is manifest order, which is
/// also the tie-break order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    entries: Vec<ReferenceEntry>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, identity: Identity, descriptors: Vec<Descriptor>) {
        if descriptors.is_empty() {
            return;
        }
        self.entries.push(ReferenceEntry {
            identity,
            descriptors,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.iter().map(|entry| &entry.identity)
    }

    /// Closest identity and its distance. Only a strictly smaller distance
    /// displaces the current best, so ties keep the earlier identity.
    pub fn nearest(&self, descriptor: &[f32]) -> Option<(&Identity, f32)> {
        let mut best: Option<(&Identity, f32)> = None;
        for entry in &self.entries {
            let distance = entry
                .descriptors
                .iter()
                .map(|reference| euclidean_distance(descriptor, reference))
                .fold(f32::INFINITY, f32::min);

            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((&entry.identity, distance)),
            }
        }
        best
    }

    /// Label one descriptor: recognized only when strictly under `threshold`.
    pub fn classify(&self, descriptor: &[f32], threshold: f32) -> (Option<Identity>, f32) {
        match self.nearest(descriptor) {
            Some((identity, distance)) if distance < threshold => (Some(identity.clone()), distance),
            Some((_, distance)) => (None, distance),
            None => (None, f32::INFINITY),
        }
    }
}

pub struct LocalMatcher {
    embedder: Arc<dyn FaceEmbedder>,
    references: RwLock<Option<Arc<ReferenceSet>>>,
    threshold: f32,
    max_reference_images: usize,
    health: HealthIndicator,
}

impl LocalMatcher {
    pub fn new(embedder: Arc<dyn FaceEmbedder>, threshold: f32, max_reference_images: usize) -> Self {
        Self {
            embedder,
            references: RwLock::new(None),
            threshold,
            max_reference_images: max_reference_images.max(1),
            health: HealthIndicator::new(BackendHealth::NotReady),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn references(&self) -> Option<Arc<ReferenceSet>> {
        self.references
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Builds a fresh set from `manifest` and swaps it in whole. Images that
    /// fail to load or contain no face are skipped; identities left with no
    /// descriptor are excluded. Returns the number of matchable identities.
    pub async fn load_references(
        &self,
        manifest: &ReferenceManifest,
        images: &dyn ImageSource,
    ) -> Result<usize> {
        let mut set = ReferenceSet::new();

        for entry in &manifest.people {
            let identity = entry.identity();
            let mut descriptors = Vec::new();

            for locator in entry.images.iter().take(self.max_reference_images) {
                match self.describe_reference(images, locator).await {
                    Ok(Some(descriptor)) => descriptors.push(descriptor),
                    Ok(None) => debug!("no face in reference {locator} for {}", identity.id),
                    Err(err) => warn!("skipping reference {locator} for {}: {err:#}", identity.id),
                }
            }

            if descriptors.is_empty() {
                warn!("{} has no usable reference images; excluded", identity.id);
                continue;
            }
            set.push(identity, descriptors);
        }

        let count = set.len();
        *self
            .references
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(set));
        self.health.record_success();
        info!("Loaded reference descriptors for {count} identities");
        Ok(count)
    }

    /// Fetches the manifest and reloads. A failed fetch leaves the current
    /// set (or the not-ready state) untouched.
    pub async fn refresh(&self, client: &ManifestClient) -> Result<usize> {
        let manifest = client
            .fetch_manifest()
            .await
            .context("matcher initialization failed")?;
        self.load_references(&manifest, client).await
    }

    /// Retries `refresh` every `retry` until a set is loaded. Returns `false`
    /// if cancelled first.
    pub async fn refresh_until_ready(
        &self,
        client: &ManifestClient,
        retry: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        while self.references().is_none() {
            match self.refresh(client).await {
                Ok(count) => {
                    info!("Local matcher ready with {count} identities");
                    return true;
                }
                Err(err) => warn!(
                    "reference reload failed; retrying in {}ms: {err:#}",
                    retry.as_millis()
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(retry) => {}
            }
        }
        true
    }

    async fn describe_reference(
        &self,
        images: &dyn ImageSource,
        locator: &str,
    ) -> Result<Option<Descriptor>> {
        let bytes = images.fetch(locator).await?;
        let embedder = Arc::clone(&self.embedder);
        tokio::task::spawn_blocking(move || {
            let image = image::load_from_memory(&bytes).context("undecodable reference image")?;
            let faces = embedder.detect_faces(&image)?;
            Ok(faces.into_iter().next().map(|face| face.descriptor))
        })
        .await
        .context("reference descriptor worker join failed")?
    }

    /// Matches every detected face against the current set.
    pub fn match_frame(&self, image: &DynamicImage) -> Result<Vec<MatchResult>> {
        let references = self
            .references()
            .ok_or_else(|| anyhow!("reference descriptors not loaded"))?;
        match_with(self.embedder.as_ref(), &references, self.threshold, image)
    }
}

fn match_with(
    embedder: &dyn FaceEmbedder,
    references: &ReferenceSet,
    threshold: f32,
    image: &DynamicImage,
) -> Result<Vec<MatchResult>> {
    let faces = embedder.detect_faces(image)?;
    Ok(faces
        .into_iter()
        .map(|face| {
            let (identity, distance) = references.classify(&face.descriptor, threshold);
            MatchResult {
                bounding_box: face.bounding_box,
                identity,
                score: MatchScore::Distance(distance),
            }
        })
        .collect())
}

#[async_trait]
impl Recognizer for LocalMatcher {
    async fn recognize(&self, _session: &SessionId, frame: &Frame) -> Vec<MatchResult> {
        let Some(references) = self.references() else {
            self.health.set_not_ready();
            return Vec::new();
        };

        let embedder = Arc::clone(&self.embedder);
        let threshold = self.threshold;
        let frame = frame.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let image = frame.decode()?;
            match_with(embedder.as_ref(), &references, threshold, &image)
        })
        .await;

        match outcome {
            Ok(Ok(results)) => {
                self.health.record_success();
                results
            }
            Ok(Err(err)) => {
                warn!("local matching failed: {err:#}");
                self.health.record_failure();
                Vec::new()
            }
            Err(err) => {
                warn!("local matching worker failed: {err}");
                self.health.record_failure();
                Vec::new()
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.references().is_some()
    }

    fn health(&self) -> watch::Receiver<BackendHealth> {
        self.health.subscribe()
    }
}
