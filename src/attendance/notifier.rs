use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::models::{Identity, SessionId};
use crate::recognition::http::join_url;

pub const MARK_PATH: &str = "/api/attendance/mark";

/// Records a confirmed mark with the attendance system.
#[async_trait]
pub trait AttendanceNotifier: Send + Sync {
    /// `true` only once the mark is known to be recorded.
    async fn notify(&self, session: &SessionId, identity: &Identity, marked_at: DateTime<Utc>)
        -> bool;
}

#[derive(Serialize)]
struct MarkRequest<'a> {
    name: &'a str,
    student_id: &'a str,
    timestamp: String,
    session_id: &'a str,
}

#[derive(Deserialize)]
struct MarkResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    duplicate: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpAttendanceNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAttendanceNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build attendance HTTP client")?;

        Ok(Self {
            client,
            endpoint: join_url(base_url, MARK_PATH),
        })
    }

    async fn try_notify(
        &self,
        session: &SessionId,
        identity: &Identity,
        marked_at: DateTime<Utc>,
    ) -> Result<()> {
        let request = MarkRequest {
            name: &identity.display_name,
            student_id: identity.id.as_str(),
            timestamp: marked_at.to_rfc3339(),
            session_id: session.as_str(),
        };

        let body: MarkResponse = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("attendance request failed")?
            .error_for_status()
            .context("attendance service returned an error status")?
            .json()
            .await
            .context("malformed attendance response")?;

        // Already recorded server-side counts as recorded.
        if body.success || body.duplicate {
            if body.duplicate {
                debug!("{} already marked for {session}", identity.id);
            }
            return Ok(());
        }

        let reason = body
            .error
            .or(body.message)
            .unwrap_or_else(|| "unspecified".to_string());
        bail!("attendance service refused mark: {reason}")
    }
}

#[async_trait]
impl AttendanceNotifier for HttpAttendanceNotifier {
    async fn notify(
        &self,
        session: &SessionId,
        identity: &Identity,
        marked_at: DateTime<Utc>,
    ) -> bool {
        match self.try_notify(session, identity, marked_at).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to mark {} in {session}: {err:#}", identity.id);
                false
            }
        }
    }
}
