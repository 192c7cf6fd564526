use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard,
    },
};

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    attendance::{AttendanceNotifier, AttendanceStabilizer},
    capture::{capture_shared, SharedLease},
    db::Database,
    models::{AttendanceMark, Frame, SessionId},
    overlay::{build_overlay, write_preview, OverlayInstruction},
    recognition::Recognizer,
};

use super::state::MonitorState;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Journal progress every this many processed frames.
const PROGRESS_EVERY_FRAMES: u64 = 10;

/// Busy flag: at most one detection cycle in flight.
#[derive(Clone, Default)]
pub struct CycleGate {
    busy: Arc<AtomicBool>,
}

/// Proof of holding the gate; the flag clears when it is dropped, including
/// when the owning task is aborted.
pub struct CycleTicket {
    busy: Arc<AtomicBool>,
}

impl CycleGate {
    pub fn try_enter(&self) -> Option<CycleTicket> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleTicket {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for CycleTicket {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    /// The previous cycle is still running; this tick is dropped.
    Skipped,
    /// The backend cannot match yet; nothing was captured.
    NotReady,
}

/// Everything one cycle touches.
pub struct CycleContext {
    pub session: SessionId,
    pub lease: SharedLease,
    pub recognizer: Arc<dyn Recognizer>,
    pub notifier: Arc<dyn AttendanceNotifier>,
    pub stabilizer: Arc<Mutex<AttendanceStabilizer>>,
    pub state: Arc<StdMutex<MonitorState>>,
    pub overlay: Arc<watch::Sender<Vec<OverlayInstruction>>>,
    pub marks: broadcast::Sender<AttendanceMark>,
    pub db: Option<Database>,
    pub preview: Option<PathBuf>,
    pub cancel: CancellationToken,
}

pub(crate) fn lock_state(state: &StdMutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct DetectionLoop {
    ctx: Arc<CycleContext>,
    gate: CycleGate,
    in_flight: Option<JoinHandle<()>>,
}

impl DetectionLoop {
    pub fn new(ctx: CycleContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            gate: CycleGate::default(),
            in_flight: None,
        }
    }

    pub fn gate(&self) -> &CycleGate {
        &self.gate
    }

    /// Starts a cycle unless one is already running. Never waits.
    pub fn on_tick(&mut self) -> TickOutcome {
        if !self.ctx.recognizer.is_ready() {
            lock_state(&self.ctx.state).not_ready_cycles += 1;
            log_debug!("recognizer not ready; tick ignored");
            return TickOutcome::NotReady;
        }

        let Some(ticket) = self.gate.try_enter() else {
            lock_state(&self.ctx.state).skipped_cycles += 1;
            log_debug!("previous cycle still running; tick skipped");
            return TickOutcome::Skipped;
        };

        let ctx = Arc::clone(&self.ctx);
        self.in_flight = Some(tokio::spawn(async move {
            let _ticket = ticket;
            run_cycle(&ctx).await;
        }));
        TickOutcome::Started
    }

    /// Waits for the in-flight cycle, if any.
    pub async fn settle(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    log_error!("detection cycle panicked: {err}");
                }
            }
        }
    }

    /// Drives cycles every `interval` until cancelled, then aborts whatever
    /// is still in flight so its results are never applied.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.ctx.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info!("detection loop shutting down for {}", self.ctx.session);
                    break;
                }
                _ = ticker.tick() => {
                    self.on_tick();
                }
            }
        }

        if let Some(handle) = &self.in_flight {
            handle.abort();
        }
        self.settle().await;
    }
}

async fn run_cycle(ctx: &CycleContext) {
    let frame = match capture_shared(&ctx.lease).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            log_debug!("no frame available this cycle");
            return;
        }
        Err(err) => {
            log_warn!("frame capture failed: {err:#}");
            return;
        }
    };

    let batch = ctx.recognizer.recognize(&ctx.session, &frame).await;
    if ctx.cancel.is_cancelled() {
        return;
    }

    let overlay = build_overlay(&batch);
    if let Some(path) = &ctx.preview {
        save_preview(frame.clone(), overlay.clone(), path.clone()).await;
    }
    ctx.overlay.send_replace(overlay);

    let marks = {
        let mut stabilizer = ctx.stabilizer.lock().await;
        if stabilizer.session() != &ctx.session {
            return;
        }
        let marks = stabilizer
            .process_batch(&batch, ctx.notifier.as_ref(), Utc::now())
            .await;
        let marked_count = stabilizer.marked_count();

        let mut state = lock_state(&ctx.state);
        state.frames_processed += 1;
        state.marked_count = marked_count;
        marks
    };

    log_debug!(
        "frame {} -> {} faces, {} new marks",
        frame.seq,
        batch.len(),
        marks.len()
    );

    for mark in marks {
        if let Some(db) = &ctx.db {
            if let Err(err) = db.insert_mark(&mark).await {
                log_error!("failed to journal mark for {}: {err:?}", mark.identity.id);
            }
        }
        // No subscribers is fine.
        let _ = ctx.marks.send(mark);
    }

    journal_progress(ctx).await;
}

async fn save_preview(frame: Frame, overlay: Vec<OverlayInstruction>, path: PathBuf) {
    let written = tokio::task::spawn_blocking(move || write_preview(&frame, &overlay, &path)).await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            log_warn!("preview not saved: {err:#}");
        }
        Err(err) => {
            log_warn!("preview worker failed: {err}");
        }
    }
}

async fn journal_progress(ctx: &CycleContext) {
    let Some(db) = &ctx.db else {
        return;
    };
    let (frames, skipped) = {
        let state = lock_state(&ctx.state);
        (state.frames_processed, state.skipped_cycles)
    };
    if frames % PROGRESS_EVERY_FRAMES != 0 {
        return;
    }
    if let Err(err) = db
        .update_session_progress(ctx.session.as_str(), frames, skipped, Utc::now())
        .await
    {
        log_warn!("failed to journal progress: {err:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{share, Camera, CameraError, CameraProvider, FrameSource};
    use crate::models::{BoundingBox, Frame, Identity, MatchResult, MatchScore};
    use crate::recognition::{BackendHealth, HealthIndicator};
    use async_trait::async_trait;
    use chrono::DateTime;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    struct StillCamera;

    impl Camera for StillCamera {
        fn grab(&mut self) -> Result<DynamicImage, CameraError> {
            Ok(DynamicImage::ImageRgb8(RgbImage::new(8, 8)))
        }
    }

    struct StillProvider;

    impl CameraProvider for StillProvider {
        fn open(&self) -> Result<Box<dyn Camera>, CameraError> {
            Ok(Box::new(StillCamera))
        }
    }

    /// Each call waits for a permit, so tests decide when a cycle finishes.
    struct GatedRecognizer {
        permits: Semaphore,
        calls: AtomicUsize,
        ready: AtomicBool,
        health: HealthIndicator,
    }

    impl GatedRecognizer {
        fn new() -> Self {
            Self {
                permits: Semaphore::new(0),
                calls: AtomicUsize::new(0),
                ready: AtomicBool::new(true),
                health: HealthIndicator::default(),
            }
        }
    }

    #[async_trait]
    impl Recognizer for GatedRecognizer {
        async fn recognize(&self, _session: &SessionId, _frame: &Frame) -> Vec<MatchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
            vec![MatchResult {
                bounding_box: BoundingBox::new(0, 0, 4, 4),
                identity: Some(Identity::new("ada", "Ada")),
                score: MatchScore::Confidence(90.0),
            }]
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn health(&self) -> watch::Receiver<BackendHealth> {
            self.health.subscribe()
        }
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl AttendanceNotifier for CountingNotifier {
        async fn notify(&self, _s: &SessionId, _i: &Identity, _at: DateTime<Utc>) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct Harness {
        detection: DetectionLoop,
        recognizer: Arc<GatedRecognizer>,
        notifier: Arc<CountingNotifier>,
        state: Arc<StdMutex<MonitorState>>,
        overlay: watch::Receiver<Vec<OverlayInstruction>>,
        marks: broadcast::Receiver<AttendanceMark>,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        harness_with_preview(None)
    }

    fn harness_with_preview(preview: Option<PathBuf>) -> Harness {
        let session = SessionId::new("s1");
        let recognizer = Arc::new(GatedRecognizer::new());
        let notifier = Arc::new(CountingNotifier::default());
        let state = Arc::new(StdMutex::new(MonitorState::new()));
        let (overlay_tx, overlay) = watch::channel(Vec::new());
        let (marks_tx, marks) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let lease = share(FrameSource::new(Arc::new(StillProvider)).acquire().unwrap());

        let detection = DetectionLoop::new(CycleContext {
            session: session.clone(),
            lease,
            recognizer: recognizer.clone(),
            notifier: notifier.clone(),
            stabilizer: Arc::new(Mutex::new(AttendanceStabilizer::new(session, 1))),
            state: state.clone(),
            overlay: Arc::new(overlay_tx),
            marks: marks_tx,
            db: None,
            preview,
            cancel: cancel.clone(),
        });

        Harness {
            detection,
            recognizer,
            notifier,
            state,
            overlay,
            marks,
            cancel,
        }
    }

    async fn wait_for_call(recognizer: &GatedRecognizer, n: usize) {
        while recognizer.calls.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn gate_admits_one_holder() {
        let gate = CycleGate::default();
        let ticket = gate.try_enter().unwrap();
        assert!(gate.try_enter().is_none());
        drop(ticket);
        assert!(!gate.is_busy());
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test]
    async fn ticks_while_busy_are_skipped_not_queued() {
        let mut h = harness();

        assert_eq!(h.detection.on_tick(), TickOutcome::Started);
        wait_for_call(&h.recognizer, 1).await;

        for _ in 0..3 {
            assert_eq!(h.detection.on_tick(), TickOutcome::Skipped);
        }
        assert_eq!(h.recognizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(lock_state(&h.state).skipped_cycles, 3);

        h.recognizer.permits.add_permits(1);
        h.detection.settle().await;
        assert!(!h.detection.gate().is_busy());

        // Skipped ticks did not pile up behind the finished cycle.
        assert_eq!(h.recognizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.detection.on_tick(), TickOutcome::Started);
        wait_for_call(&h.recognizer, 2).await;
        h.recognizer.permits.add_permits(1);
        h.detection.settle().await;
    }

    #[tokio::test]
    async fn completed_cycle_publishes_overlay_and_mark() {
        let mut h = harness();
        h.recognizer.permits.add_permits(1);

        assert_eq!(h.detection.on_tick(), TickOutcome::Started);
        h.detection.settle().await;

        assert_eq!(h.overlay.borrow().len(), 1);
        assert_eq!(h.overlay.borrow()[0].label, "Ada (90%)");
        let mark = h.marks.try_recv().unwrap();
        assert_eq!(mark.identity.id.as_str(), "ada");
        assert_eq!(lock_state(&h.state).frames_processed, 1);
        assert_eq!(lock_state(&h.state).marked_count, 1);
        assert_eq!(h.notifier.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_ready_backend_is_not_called() {
        let mut h = harness();
        h.recognizer.ready.store(false, Ordering::SeqCst);

        assert_eq!(h.detection.on_tick(), TickOutcome::NotReady);
        assert_eq!(h.recognizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(lock_state(&h.state).not_ready_cycles, 1);
    }

    #[tokio::test]
    async fn cycles_start_once_backend_becomes_ready() {
        let mut h = harness();
        h.recognizer.ready.store(false, Ordering::SeqCst);
        assert_eq!(h.detection.on_tick(), TickOutcome::NotReady);

        h.recognizer.ready.store(true, Ordering::SeqCst);
        h.recognizer.permits.add_permits(1);
        assert_eq!(h.detection.on_tick(), TickOutcome::Started);
        h.detection.settle().await;
        assert_eq!(lock_state(&h.state).frames_processed, 1);
    }

    #[tokio::test]
    async fn preview_is_saved_after_a_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.png");
        let mut h = harness_with_preview(Some(path.clone()));
        h.recognizer.permits.add_permits(1);

        assert_eq!(h.detection.on_tick(), TickOutcome::Started);
        h.detection.settle().await;

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (8, 8));
        assert_eq!(*saved.get_pixel(0, 0), image::Rgb(crate::overlay::RECOGNIZED_COLOR));
    }

    #[tokio::test]
    async fn cancellation_discards_in_flight_results() {
        let mut h = harness();

        assert_eq!(h.detection.on_tick(), TickOutcome::Started);
        wait_for_call(&h.recognizer, 1).await;

        h.cancel.cancel();
        h.recognizer.permits.add_permits(1);
        h.detection.settle().await;

        assert!(h.overlay.borrow().is_empty());
        assert!(h.marks.try_recv().is_err());
        assert_eq!(h.notifier.0.load(Ordering::SeqCst), 0);
        assert!(!h.detection.gate().is_busy());
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_releases_gate() {
        let h = harness();
        let gate = h.detection.gate().clone();
        let recognizer = h.recognizer.clone();
        let task = tokio::spawn(h.detection.run(Duration::from_millis(5)));

        wait_for_call(&recognizer, 1).await;
        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        // The blocked cycle was aborted rather than awaited.
        assert!(!gate.is_busy());
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }
}
