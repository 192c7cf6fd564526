use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::watch;

use crate::models::{Frame, MatchResult, SessionId};

use super::{
    health::{BackendHealth, HealthIndicator},
    wire::{RecognizeRequest, RecognizeResponse, WireFace},
    Recognizer,
};

pub const RECOGNIZE_PATH: &str = "/api/face-recognition/recognize";

/// One POST per frame. The detection loop only calls again once the previous
/// call has resolved, so requests never queue up behind each other.
pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: String,
    health: HealthIndicator,
}

impl HttpRecognizer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build recognition HTTP client")?;

        Ok(Self {
            client,
            endpoint: join_url(base_url, RECOGNIZE_PATH),
            health: HealthIndicator::default(),
        })
    }

    async fn try_recognize(&self, frame: &Frame) -> Result<Vec<MatchResult>> {
        let image = frame.to_base64();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RecognizeRequest { image: &image })
            .send()
            .await
            .context("recognition request failed")?
            .error_for_status()
            .context("recognition service returned an error status")?;

        let body: RecognizeResponse = response
            .json()
            .await
            .context("malformed recognition response")?;

        if let Some(error) = body.error {
            bail!("recognition service rejected frame: {error}");
        }

        Ok(body
            .faces
            .into_iter()
            .map(WireFace::into_match_result)
            .collect())
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn recognize(&self, _session: &SessionId, frame: &Frame) -> Vec<MatchResult> {
        match self.try_recognize(frame).await {
            Ok(results) => {
                debug!("frame {} -> {} faces", frame.seq, results.len());
                self.health.record_success();
                results
            }
            Err(err) => {
                warn!("recognition failed for frame {}: {err:#}", frame.seq);
                self.health.record_failure();
                Vec::new()
            }
        }
    }

    fn health(&self) -> watch::Receiver<BackendHealth> {
        self.health.subscribe()
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port_url, spawn_http_stub};
    use chrono::Utc;
    use image::{DynamicImage, RgbImage};

    fn frame() -> Frame {
        Frame::from_image(3, Utc::now(), &DynamicImage::ImageRgb8(RgbImage::new(8, 8))).unwrap()
    }

    fn session() -> SessionId {
        SessionId::new("lecture-1")
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://a/", "/b"), "http://a/b");
        assert_eq!(join_url("http://a", "b"), "http://a/b");
    }

    #[tokio::test]
    async fn posts_frame_and_parses_faces() {
        let stub = spawn_http_stub(vec![(
            200,
            r#"{"success":true,"faces":[{"recognized":true,"student_id":"s1","name":"Ada","confidence":91.0,"bbox":{"x":1,"y":2,"w":3,"h":4}}]}"#
                .into(),
        )])
        .await;
        let recognizer = HttpRecognizer::new(&stub.base_url, Duration::from_secs(2)).unwrap();

        let results = recognizer.recognize(&session(), &frame()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity.as_ref().unwrap().id.as_str(), "s1");
        assert_eq!(*recognizer.health().borrow(), BackendHealth::Healthy);

        let requests = stub.requests();
        assert!(requests[0].request_line.starts_with("POST /api/face-recognition/recognize"));
        assert!(requests[0].json()["image"].as_str().unwrap().len() > 10);
    }

    #[tokio::test]
    async fn unreachable_backend_degrades_to_empty_batch() {
        let url = closed_port_url().await;
        let recognizer = HttpRecognizer::new(&url, Duration::from_millis(500)).unwrap();

        let results = recognizer.recognize(&session(), &frame()).await;
        assert!(results.is_empty());
        assert_eq!(
            *recognizer.health().borrow(),
            BackendHealth::Degraded {
                consecutive_failures: 1
            }
        );
    }

    #[tokio::test]
    async fn malformed_and_error_responses_degrade_then_recover() {
        let stub = spawn_http_stub(vec![
            (200, "not json".into()),
            (500, r#"{"error":"boom"}"#.into()),
            (200, r#"{"error":"Invalid image"}"#.into()),
            (200, r#"{"success":true,"faces":[]}"#.into()),
        ])
        .await;
        let recognizer = HttpRecognizer::new(&stub.base_url, Duration::from_secs(2)).unwrap();

        for _ in 0..3 {
            assert!(recognizer.recognize(&session(), &frame()).await.is_empty());
        }
        assert_eq!(
            *recognizer.health().borrow(),
            BackendHealth::Degraded {
                consecutive_failures: 3
            }
        );

        assert!(recognizer.recognize(&session(), &frame()).await.is_empty());
        assert_eq!(*recognizer.health().borrow(), BackendHealth::Healthy);
    }
}
