use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use chrono::Utc;
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    attendance::{AttendanceNotifier, AttendanceStabilizer},
    capture::{release_shared, share, CameraError, FrameSource, SharedLease},
    config::DetectionSettings,
    db::{Database, MonitorSession, SessionStatus},
    models::{AttendanceMark, SessionId},
    overlay::OverlayInstruction,
    recognition::{BackendHealth, Recognizer},
};

use super::{
    loop_worker::{lock_state, CycleContext, DetectionLoop},
    state::{MonitorSnapshot, MonitorState},
};

const MARK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("monitoring already active")]
    AlreadyRunning,
    /// Camera could not be opened. Not retried; the caller decides.
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct ActiveSession {
    session: SessionId,
    lease: SharedLease,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        release_shared(&self.lease);
    }
}

/// Owns the monitoring lifecycle: camera lease, detection loop and the
/// per-session attendance state.
pub struct MonitorController {
    frame_source: FrameSource,
    recognizer: Arc<dyn Recognizer>,
    notifier: Arc<dyn AttendanceNotifier>,
    db: Option<Database>,
    settings: DetectionSettings,
    state: Arc<StdMutex<MonitorState>>,
    stabilizer: Arc<Mutex<AttendanceStabilizer>>,
    overlay_tx: Arc<watch::Sender<Vec<OverlayInstruction>>>,
    marks_tx: broadcast::Sender<AttendanceMark>,
    active: Mutex<Option<ActiveSession>>,
}

impl MonitorController {
    pub fn new(
        frame_source: FrameSource,
        recognizer: Arc<dyn Recognizer>,
        notifier: Arc<dyn AttendanceNotifier>,
        db: Option<Database>,
        settings: DetectionSettings,
    ) -> Self {
        let (overlay_tx, _) = watch::channel(Vec::new());
        let (marks_tx, _) = broadcast::channel(MARK_CHANNEL_CAPACITY);
        let stabilizer = AttendanceStabilizer::new(SessionId::new(""), settings.confirmation_streak);

        Self {
            frame_source,
            recognizer,
            notifier,
            db,
            settings,
            state: Arc::new(StdMutex::new(MonitorState::new())),
            stabilizer: Arc::new(Mutex::new(stabilizer)),
            overlay_tx: Arc::new(overlay_tx),
            marks_tx,
            active: Mutex::new(None),
        }
    }

    /// Opens the camera and starts the detection loop under a fresh session.
    pub async fn start_session(&self) -> Result<SessionId, StartError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let source = self.frame_source.clone();
        let lease = tokio::task::spawn_blocking(move || source.acquire())
            .await
            .context("camera open worker join failed")??;
        let lease = share(lease);

        let session = SessionId::generate();
        let started_at = Utc::now();

        if let Some(db) = &self.db {
            db.insert_session(&MonitorSession::started(session.as_str(), started_at))
                .await?;
        }

        self.stabilizer.lock().await.reset(session.clone());
        lock_state(&self.state).begin_session(session.to_string(), started_at);
        self.overlay_tx.send_replace(Vec::new());
        self.recognizer.begin_session(&session).await;

        let cancel = CancellationToken::new();
        let detection = DetectionLoop::new(CycleContext {
            session: session.clone(),
            lease: Arc::clone(&lease),
            recognizer: Arc::clone(&self.recognizer),
            notifier: Arc::clone(&self.notifier),
            stabilizer: Arc::clone(&self.stabilizer),
            state: Arc::clone(&self.state),
            overlay: Arc::clone(&self.overlay_tx),
            marks: self.marks_tx.clone(),
            db: self.db.clone(),
            preview: self.settings.preview_path.clone(),
            cancel: cancel.clone(),
        });
        let handle = tokio::spawn(detection.run(self.settings.interval()));

        info!("Monitoring session {session} started");
        *active = Some(ActiveSession {
            session: session.clone(),
            lease,
            cancel,
            handle: Some(handle),
        });
        Ok(session)
    }

    /// Stops the loop, releases the camera and discards the session's
    /// attendance state. Idempotent.
    pub async fn end_session(&self) -> anyhow::Result<MonitorSnapshot> {
        let Some(mut ended) = self.active.lock().await.take() else {
            return Ok(self.snapshot());
        };

        ended.cancel.cancel();
        if let Some(handle) = ended.handle.take() {
            if let Err(err) = handle.await {
                error!("detection loop task failed: {err}");
            }
        }
        release_shared(&ended.lease);
        self.recognizer.end_session(&ended.session).await;

        let stopped_at = Utc::now();
        let final_state = {
            let mut state = lock_state(&self.state);
            state.stop(stopped_at);
            state.clone()
        };
        self.stabilizer
            .lock()
            .await
            .reset(SessionId::new(""));
        self.overlay_tx.send_replace(Vec::new());

        if let Some(db) = &self.db {
            let id = ended.session.as_str();
            if let Err(err) = db
                .update_session_progress(
                    id,
                    final_state.frames_processed,
                    final_state.skipped_cycles,
                    stopped_at,
                )
                .await
            {
                warn!("failed to journal final progress for {id}: {err:?}");
            }
            db.mark_session_status(id, SessionStatus::Completed, Some(stopped_at), stopped_at)
                .await?;
        }

        info!(
            "Monitoring session {} ended: {} frames, {} marked",
            ended.session, final_state.frames_processed, final_state.marked_count
        );
        Ok(MonitorSnapshot {
            state: final_state,
            health: *self.recognizer.health().borrow(),
        })
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            state: lock_state(&self.state).clone(),
            health: *self.recognizer.health().borrow(),
        }
    }

    pub fn subscribe_marks(&self) -> broadcast::Receiver<AttendanceMark> {
        self.marks_tx.subscribe()
    }

    pub fn subscribe_overlay(&self) -> watch::Receiver<Vec<OverlayInstruction>> {
        self.overlay_tx.subscribe()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<BackendHealth> {
        self.recognizer.health()
    }
}
