use std::time::Duration;

use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Frame, Identity};
use crate::recognition::http::join_url;

pub const ENROLL_PATH: &str = "/api/face-recognition/enroll";

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("at least {required} frames are required, got {given}")]
    TooFewFrames { given: usize, required: usize },
    /// The backend refused; the reason is its own wording.
    #[error("enrollment rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrollmentReceipt {
    #[serde(default)]
    pub faces_enrolled: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize)]
struct EnrollRequest<'a> {
    student_id: &'a str,
    name: &'a str,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct EnrollResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    faces_enrolled: Option<u32>,
}

impl EnrollResponse {
    fn rejection(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        if let Some(detail) = &self.detail {
            return Some(match detail {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            });
        }
        if self.success == Some(false) {
            return Some(
                self.message
                    .clone()
                    .unwrap_or_else(|| "enrollment refused".to_string()),
            );
        }
        None
    }
}

pub struct EnrollmentClient {
    client: reqwest::Client,
    endpoint: String,
    min_frames: usize,
}

impl EnrollmentClient {
    pub fn new(base_url: &str, timeout: Duration, min_frames: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build enrollment HTTP client")?;

        Ok(Self {
            client,
            endpoint: join_url(base_url, ENROLL_PATH),
            min_frames,
        })
    }

    /// Uploads `frames` for `identity`. Short submissions are refused before
    /// anything is sent.
    pub async fn submit(
        &self,
        identity: &Identity,
        frames: &[Frame],
    ) -> Result<EnrollmentReceipt, EnrollmentError> {
        if frames.len() < self.min_frames {
            return Err(EnrollmentError::TooFewFrames {
                given: frames.len(),
                required: self.min_frames,
            });
        }

        let request = EnrollRequest {
            student_id: identity.id.as_str(),
            name: &identity.display_name,
            images: frames.iter().map(Frame::to_base64).collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("enrollment upload failed")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read enrollment response")?;
        let body: Option<EnrollResponse> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let reason = body
                .as_ref()
                .and_then(EnrollResponse::rejection)
                .unwrap_or_else(|| format!("HTTP {status}: {text}"));
            return Err(EnrollmentError::Rejected(reason));
        }

        let body = body.context("malformed enrollment response")?;
        if let Some(reason) = body.rejection() {
            return Err(EnrollmentError::Rejected(reason));
        }

        info!(
            "Enrolled {} with {} frames",
            identity.id,
            frames.len()
        );
        Ok(EnrollmentReceipt {
            faces_enrolled: body.faces_enrolled,
            message: body.message,
        })
    }
}
