use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recognition::BackendHealth;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MonitorStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    pub status: MonitorStatus,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Cycles that got as far as a recognition result.
    pub frames_processed: u64,
    /// Ticks dropped because the previous cycle was still running.
    pub skipped_cycles: u64,
    /// Ticks dropped because the backend could not match yet.
    pub not_ready_cycles: u64,
    pub marked_count: usize,
}

impl MonitorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.status == MonitorStatus::Running
    }

    pub fn begin_session(&mut self, session_id: String, started_at: DateTime<Utc>) {
        *self = Self {
            status: MonitorStatus::Running,
            session_id: Some(session_id),
            started_at: Some(started_at),
            ..Self::default()
        };
    }

    pub fn stop(&mut self, stopped_at: DateTime<Utc>) {
        self.status = MonitorStatus::Stopped;
        self.stopped_at = Some(stopped_at);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub state: MonitorState,
    pub health: BackendHealth,
}
