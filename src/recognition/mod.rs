//! Recognition backends.
//!
//! Remote request/response, remote streaming and the in-process matcher all
//! sit behind [`Recognizer`], so the detection loop does not care which one
//! is configured. None of them ever returns an error to the loop: transport
//! trouble shows up as an empty batch plus a health update.

pub mod embedder;
pub mod health;
pub mod http;
pub mod manifest;
pub mod matcher;
pub mod stream;
pub mod wire;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::models::{Frame, MatchResult, SessionId};

pub use embedder::{euclidean_distance, Descriptor, DetectedFace, FaceEmbedder, GrayscaleEmbedder};
pub use health::{BackendHealth, HealthIndicator};
pub use http::HttpRecognizer;
pub use manifest::{ImageSource, ManifestClient, ManifestEntry, ReferenceManifest};
pub use matcher::{LocalMatcher, ReferenceSet};
pub use stream::StreamRecognizer;

#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Match every face in `frame`. Failures yield an empty batch.
    async fn recognize(&self, session: &SessionId, frame: &Frame) -> Vec<MatchResult>;

    /// Called when monitoring starts; results for any other session are dropped.
    async fn begin_session(&self, _session: &SessionId) {}

    async fn end_session(&self, _session: &SessionId) {}

    /// `false` while the backend cannot produce matches at all (e.g. the
    /// local matcher before its first successful reference load).
    fn is_ready(&self) -> bool {
        true
    }

    fn health(&self) -> watch::Receiver<BackendHealth>;
}
