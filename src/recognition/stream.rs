//! Streaming recognition over a persistent WebSocket.
//!
//! A background task owns the socket. `recognize` hands it a frame plus a
//! oneshot for the reply and waits with a timeout. When the socket drops,
//! every pending reply is dropped with it and the task reconnects with
//! jittered exponential backoff; frames submitted while connecting or
//! disconnected are answered with nothing rather than queued.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, watch,
    },
    time::{self, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::{
    config::BackendSettings,
    models::{Frame, MatchResult, SessionId},
};

use super::{
    health::{BackendHealth, HealthIndicator},
    wire::{StreamFrame, StreamMessage, WireFace},
    Recognizer,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const COMMAND_CAPACITY: usize = 16;
const MAX_PENDING: usize = 32;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ActiveSession = Arc<RwLock<Option<SessionId>>>;

struct PendingFrame {
    frame_id: u64,
    session: SessionId,
    reply: oneshot::Sender<Vec<MatchResult>>,
}

struct OutboundFrame {
    payload: String,
    pending: PendingFrame,
}

enum ConnectionEnd {
    Disconnected,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    /// Next delay with up to 25% jitter, then doubles the base for next time.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay + Duration::from_millis(jitter)
    }
}

pub struct StreamRecognizer {
    commands: mpsc::Sender<OutboundFrame>,
    active_session: ActiveSession,
    health: HealthIndicator,
    reply_timeout: Duration,
    next_frame_id: AtomicU64,
    shutdown: CancellationToken,
}

impl StreamRecognizer {
    /// Spawns the connection task; the first connect happens in the background.
    pub fn connect(settings: &BackendSettings) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let active_session: ActiveSession = Arc::new(RwLock::new(None));
        let health = HealthIndicator::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(connection_task(
            settings.stream_url.clone(),
            rx,
            Arc::clone(&active_session),
            health.clone(),
            Backoff::new(
                Duration::from_millis(settings.reconnect_base_ms),
                Duration::from_millis(settings.reconnect_max_ms),
            ),
            shutdown.clone(),
        ));

        Self {
            commands,
            active_session,
            health,
            reply_timeout: settings.request_timeout(),
            next_frame_id: AtomicU64::new(0),
            shutdown,
        }
    }

    fn is_active(&self, session: &SessionId) -> bool {
        read_session(&self.active_session).as_ref() == Some(session)
    }
}

impl Drop for StreamRecognizer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Recognizer for StreamRecognizer {
    async fn recognize(&self, session: &SessionId, frame: &Frame) -> Vec<MatchResult> {
        if !self.is_active(session) {
            log_debug!("frame {} submitted for inactive session {session}; skipping", frame.seq);
            return Vec::new();
        }

        let frame_id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let image = frame.to_base64();
        let payload = match serde_json::to_string(&StreamFrame {
            kind: "frame",
            image: &image,
            session_id: session.as_str(),
            frame_id,
        }) {
            Ok(payload) => payload,
            Err(err) => {
                log_warn!("failed to encode stream frame: {err}");
                return Vec::new();
            }
        };

        let (reply, reply_rx) = oneshot::channel();
        let outbound = OutboundFrame {
            payload,
            pending: PendingFrame {
                frame_id,
                session: session.clone(),
                reply,
            },
        };

        if let Err(err) = self.commands.try_send(outbound) {
            match err {
                TrySendError::Full(_) => {
                    log_warn!("stream backlog full; dropping frame {frame_id}");
                }
                TrySendError::Closed(_) => {
                    log_debug!("stream task gone; frame {frame_id} dropped");
                }
            }
            self.health.record_failure();
            return Vec::new();
        }

        match time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(results)) => {
                self.health.record_success();
                results
            }
            Ok(Err(_)) => {
                log_debug!("frame {frame_id} dropped before a result arrived");
                self.health.record_failure();
                Vec::new()
            }
            Err(_) => {
                log_warn!(
                    "no stream result for frame {frame_id} within {}ms",
                    self.reply_timeout.as_millis()
                );
                self.health.record_failure();
                Vec::new()
            }
        }
    }

    async fn begin_session(&self, session: &SessionId) {
        *self
            .active_session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session.clone());
    }

    async fn end_session(&self, session: &SessionId) {
        let mut guard = self
            .active_session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.as_ref() == Some(session) {
            *guard = None;
        }
    }

    fn health(&self) -> watch::Receiver<BackendHealth> {
        self.health.subscribe()
    }
}

fn read_session(active: &ActiveSession) -> Option<SessionId> {
    active
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

async fn connection_task(
    url: String,
    mut commands: mpsc::Receiver<OutboundFrame>,
    active_session: ActiveSession,
    health: HealthIndicator,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    loop {
        let connecting = connect_async(url.as_str());
        tokio::pin!(connecting);
        let connected = loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = &mut connecting => break result,
                command = commands.recv() => match command {
                    Some(outbound) => {
                        log_debug!("dropping frame {} while connecting", outbound.pending.frame_id);
                    }
                    None => return,
                },
            }
        };

        match connected {
            Ok((socket, _)) => {
                log_info!("recognition stream connected to {url}");
                backoff.reset();
                match run_connection(socket, &mut commands, &active_session, &health, &shutdown).await {
                    ConnectionEnd::Shutdown => return,
                    ConnectionEnd::Disconnected => {
                        log_warn!("recognition stream disconnected; reconnecting");
                        health.record_failure();
                    }
                }
            }
            Err(err) => {
                log_warn!("recognition stream connect to {url} failed: {err}");
                health.record_failure();
            }
        }

        let deadline = Instant::now() + backoff.next_delay();
        if !reject_until(deadline, &mut commands, &shutdown).await {
            return;
        }
    }
}

/// Waits out the reconnect delay. Frames arriving meanwhile are dropped so
/// nothing is buffered across a disconnect. Returns `false` on shutdown.
async fn reject_until(
    deadline: Instant,
    commands: &mut mpsc::Receiver<OutboundFrame>,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = time::sleep_until(deadline) => return true,
            command = commands.recv() => match command {
                Some(outbound) => {
                    log_debug!("dropping frame {} while disconnected", outbound.pending.frame_id);
                }
                None => return false,
            },
        }
    }
}

async fn run_connection(
    socket: Socket,
    commands: &mut mpsc::Receiver<OutboundFrame>,
    active_session: &ActiveSession,
    health: &HealthIndicator,
    shutdown: &CancellationToken,
) -> ConnectionEnd {
    let (mut sink, mut inbound) = socket.split();
    let mut pending: VecDeque<PendingFrame> = VecDeque::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                return ConnectionEnd::Shutdown;
            }
            command = commands.recv() => {
                let Some(outbound) = command else {
                    let _ = sink.close().await;
                    return ConnectionEnd::Shutdown;
                };
                if let Err(err) = sink.send(Message::Text(outbound.payload)).await {
                    log_warn!("failed to push frame {}: {err}", outbound.pending.frame_id);
                    return ConnectionEnd::Disconnected;
                }
                prune_abandoned(&mut pending);
                pending.push_back(outbound.pending);
                if pending.len() > MAX_PENDING {
                    pending.pop_front();
                }
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    deliver(&text, &mut pending, active_session, health);
                }
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    log_warn!("recognition stream read failed: {err}");
                    return ConnectionEnd::Disconnected;
                }
            },
        }
    }
}

/// Forgets frames whose caller already gave up. Without a `frame_id` echo a
/// frame the server never answers would otherwise absorb every later result.
fn prune_abandoned(pending: &mut VecDeque<PendingFrame>) {
    pending.retain(|entry| !entry.reply.is_closed());
}

/// Routes one inbound message to the frame it answers. Results are matched by
/// `frame_id` when the server echoes it, otherwise in send order.
fn deliver(
    text: &str,
    pending: &mut VecDeque<PendingFrame>,
    active_session: &ActiveSession,
    health: &HealthIndicator,
) {
    let message: StreamMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            log_debug!("ignoring malformed stream message: {err}");
            health.record_failure();
            return;
        }
    };

    if !message.is_result() {
        return;
    }

    let entry = match message.frame_id {
        Some(frame_id) => pending
            .iter()
            .position(|p| p.frame_id == frame_id)
            .and_then(|index| pending.remove(index)),
        None => {
            prune_abandoned(pending);
            pending.pop_front()
        }
    };

    let Some(entry) = entry else {
        log_debug!("stream result with no pending frame; dropping");
        return;
    };

    let echoed_matches = message
        .session_id
        .as_deref()
        .map_or(true, |echoed| echoed == entry.session.as_str());
    let still_active = read_session(active_session).as_ref() == Some(&entry.session);
    if !echoed_matches || !still_active {
        log_debug!("dropping result for ended session {}", entry.session);
        return;
    }

    let results = message
        .faces
        .into_iter()
        .map(WireFace::into_match_result)
        .collect();
    // The caller may have timed out already.
    let _ = entry.reply.send(results);
}
