//! One answering call, from accepted offer to teardown.
//!
//! Each session owns a worker task that is the only place engine operations
//! run: negotiation first, then engine events, queued remote candidates and
//! the disconnect grace timer, all multiplexed in one `select!` loop. That
//! keeps every mutation of a session's engine serialized.
//!
//! Neither the worker nor the watchdog ever tears the session down directly.
//! They ask the manager through an [`ExitHandle`], and the manager removes the
//! session from its map before calling [`CallSession::close`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::Instrument;

use super::manager::ExitHandle;
use super::watchdog::Watchdog;
use crate::candidate::{self, TranslatedCandidate};
use crate::engine::{ConnectivityState, EngineError, EngineEvent, EngineEvents, EngineHandle};
use crate::media::{MediaAttachment, MediaTrack};
use crate::protocol::{AnswerIdentity, SessionDescription, Signal};
use crate::transport::SignalSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Negotiating,
    AwaitingConnectivity,
    Connected,
    Closed,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Closed | CallState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Negotiating => "negotiating",
            CallState::AwaitingConnectivity => "awaiting_connectivity",
            CallState::Connected => "connected",
            CallState::Closed => "closed",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended. Decides whether it lands in `Closed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    Hangup,
    UserLeft,
    Reconnect,
    Replaced,
    Declined,
    ConnectivityFailed,
    NegotiationFailed,
    Timeout,
    Disconnected,
}

impl EndReason {
    pub fn terminal_state(self) -> CallState {
        match self {
            EndReason::Hangup
            | EndReason::UserLeft
            | EndReason::Reconnect
            | EndReason::Replaced
            | EndReason::Declined => CallState::Closed,
            EndReason::ConnectivityFailed
            | EndReason::NegotiationFailed
            | EndReason::Timeout
            | EndReason::Disconnected => CallState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::UserLeft => "user_left",
            EndReason::Reconnect => "reconnect",
            EndReason::Replaced => "replaced",
            EndReason::Declined => "declined",
            EndReason::ConnectivityFailed => "connectivity_failed",
            EndReason::NegotiationFailed => "negotiation_failed",
            EndReason::Timeout => "timeout",
            EndReason::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub disconnect_grace: Duration,
    pub display_name: String,
}

enum SessionOp {
    RemoteCandidate(TranslatedCandidate),
}

struct Status {
    state: CallState,
    connectivity: ConnectivityState,
}

/// Inputs consumed once, when the worker starts.
struct Launch {
    events: EngineEvents,
    ops: mpsc::UnboundedReceiver<SessionOp>,
    outbound: SignalSender,
    exit: ExitHandle,
}

enum Step {
    Continue,
    StartGrace,
    ClearGrace,
    Exit(EndReason),
}

/// A session that has left every live state but still owns its engine handle.
pub(crate) struct Halted {
    reason: EndReason,
    previous: CallState,
    engine: Option<Arc<dyn EngineHandle>>,
}

pub struct CallSession {
    peer_id: String,
    generation: u64,
    span: tracing::Span,
    config: SessionConfig,
    status: Mutex<Status>,
    engine: Mutex<Option<Arc<dyn EngineHandle>>>,
    media: Mutex<Option<MediaAttachment>>,
    watchdog: Mutex<Watchdog>,
    ops: mpsc::UnboundedSender<SessionOp>,
    launch: Mutex<Option<Launch>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: String,
        generation: u64,
        config: SessionConfig,
        engine: Arc<dyn EngineHandle>,
        events: EngineEvents,
        media: Option<MediaAttachment>,
        outbound: SignalSender,
        exit: ExitHandle,
    ) -> Arc<Self> {
        let span = tracing::info_span!("call", peer_id = %peer_id, call = generation);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peer_id,
            generation,
            span,
            config,
            status: Mutex::new(Status {
                state: CallState::Idle,
                connectivity: ConnectivityState::New,
            }),
            engine: Mutex::new(Some(engine)),
            media: Mutex::new(media),
            watchdog: Mutex::new(Watchdog::new()),
            ops: ops_tx,
            launch: Mutex::new(Some(Launch {
                events,
                ops: ops_rx,
                outbound,
                exit,
            })),
            worker: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> CallState {
        self.status.lock().state
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.status.lock().connectivity
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn watchdog_armed(&self) -> bool {
        self.watchdog.lock().is_armed()
    }

    pub fn has_engine(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// `Idle -> Negotiating`: arms the watchdog and spawns the worker.
    /// Returns `false` if the session was already started or closed.
    pub fn start(self: &Arc<Self>, offer: SessionDescription) -> bool {
        let Some(launch) = self.launch.lock().take() else {
            return false;
        };
        if !self.transition(CallState::Idle, CallState::Negotiating) {
            return false;
        }

        let exit = launch.exit.clone();
        self.watchdog
            .lock()
            .arm(self.config.connect_timeout, self.span.clone(), move || {
                exit.request(EndReason::Timeout);
                std::future::ready(())
            });

        let worker = tokio::spawn(Arc::clone(self).run(offer, launch).instrument(self.span.clone()));
        *self.worker.lock() = Some(worker);
        tracing::debug!(parent: &self.span, target = "buoy.call", "negotiating");
        true
    }

    /// Queues a translated remote candidate for the worker. Candidates that
    /// arrive while negotiation is still running are applied after it, in order.
    pub fn enqueue_candidate(&self, candidate: TranslatedCandidate) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.ops.send(SessionOp::RemoteCandidate(candidate)).is_ok()
    }

    /// Releases everything the session owns. Only the first call does work.
    pub async fn close(&self, reason: EndReason) -> bool {
        match self.halt(reason) {
            Some(halted) => {
                self.finish(halted).await;
                true
            }
            None => false,
        }
    }

    /// Synchronous half of [`close`](Self::close): moves to the terminal
    /// state, stops the watchdog, worker and media, and detaches the engine.
    /// Returns `None` if the session had already ended.
    pub(crate) fn halt(&self, reason: EndReason) -> Option<Halted> {
        let previous = {
            let mut status = self.status.lock();
            if status.state.is_terminal() {
                return None;
            }
            std::mem::replace(&mut status.state, reason.terminal_state())
        };

        self.watchdog.lock().disarm();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.launch.lock().take();
        if let Some(mut media) = self.media.lock().take() {
            media.release();
        }
        let engine = self.engine.lock().take();
        Some(Halted {
            reason,
            previous,
            engine,
        })
    }

    /// Closes the detached engine handle of a halted session.
    pub(crate) async fn finish(&self, halted: Halted) {
        let Halted {
            reason,
            previous,
            engine,
        } = halted;
        if let Some(engine) = engine {
            if let Err(err) = engine.close().await {
                tracing::warn!(parent: &self.span, target = "buoy.call", error = %err, "engine close failed");
            }
        }

        tracing::info!(
            parent: &self.span,
            target = "buoy.call",
            reason = %reason,
            from = %previous,
            state = %reason.terminal_state(),
            "call session ended"
        );
    }

    fn transition(&self, from: CallState, to: CallState) -> bool {
        let mut status = self.status.lock();
        if status.state != from {
            return false;
        }
        status.state = to;
        true
    }

    fn engine(&self) -> Option<Arc<dyn EngineHandle>> {
        self.engine.lock().clone()
    }

    fn media_tracks(&self) -> Vec<MediaTrack> {
        self.media
            .lock()
            .as_ref()
            .map(|media| media.tracks().to_vec())
            .unwrap_or_default()
    }

    async fn run(self: Arc<Self>, offer: SessionDescription, launch: Launch) {
        let Launch {
            mut events,
            mut ops,
            outbound,
            exit,
        } = launch;
        let Some(engine) = self.engine() else {
            return;
        };

        let answer = match self.negotiate(engine.as_ref(), &offer).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(target = "buoy.call", error = %err, "negotiation failed");
                exit.request(EndReason::NegotiationFailed);
                return;
            }
        };

        if !self.transition(CallState::Negotiating, CallState::AwaitingConnectivity) {
            return;
        }
        let identity = AnswerIdentity::named(self.config.display_name.clone());
        match outbound.signal(
            &self.peer_id,
            Signal::Answer {
                sdp: answer.clone(),
                identity: Some(identity),
            },
        ) {
            Ok(()) => tracing::info!(target = "buoy.call", "answer sent"),
            Err(err) => tracing::warn!(target = "buoy.call", error = %err, "failed to send answer"),
        }

        let local_mid = answer.first_mid();
        let mut grace: Option<Instant> = None;
        let mut events_open = true;

        loop {
            let grace_deadline = grace;
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(EngineEvent::Connectivity(state)) => match self.on_connectivity(state) {
                        Step::Continue => {}
                        Step::StartGrace => {
                            if grace.is_none() {
                                tracing::debug!(target = "buoy.call", grace = ?self.config.disconnect_grace, "disconnected; waiting for recovery");
                                grace = Some(Instant::now() + self.config.disconnect_grace);
                            }
                        }
                        Step::ClearGrace => grace = None,
                        Step::Exit(reason) => {
                            exit.request(reason);
                            return;
                        }
                    },
                    Some(EngineEvent::LocalCandidate(local)) => {
                        let wire = candidate::to_wire(&local, local_mid.clone(), 0);
                        if let Err(err) = outbound.signal(&self.peer_id, Signal::IceCandidate { candidate: Some(wire) }) {
                            tracing::debug!(target = "buoy.call", error = %err, "local candidate not sent");
                        }
                    }
                    None => {
                        tracing::debug!(target = "buoy.call", "engine event stream ended");
                        events_open = false;
                    }
                },
                op = ops.recv() => match op {
                    Some(SessionOp::RemoteCandidate(remote)) => self.apply_candidate(engine.as_ref(), remote).await,
                    None => return,
                },
                _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                    grace = None;
                    if self.connectivity().is_connected() {
                        tracing::debug!(target = "buoy.call", "connectivity recovered within grace period");
                    } else {
                        exit.request(EndReason::Disconnected);
                        return;
                    }
                }
            }
        }
    }

    async fn negotiate(
        &self,
        engine: &dyn EngineHandle,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        let tracks = self.media_tracks();
        if !tracks.is_empty() {
            engine.attach_media(&tracks).await?;
            tracing::debug!(target = "buoy.call", tracks = tracks.len(), "media attached");
        }
        engine.set_remote_description(offer).await?;
        let answer = engine.create_answer().await?;
        engine.set_local_description(&answer).await?;
        Ok(answer)
    }

    fn on_connectivity(&self, state: ConnectivityState) -> Step {
        let became_connected = {
            let mut status = self.status.lock();
            status.connectivity = state;
            if status.state.is_terminal() {
                return Step::Continue;
            }
            if state.is_failed() {
                return Step::Exit(EndReason::ConnectivityFailed);
            }
            if state.is_disconnected() {
                return Step::StartGrace;
            }
            if !state.is_connected() {
                return Step::Continue;
            }
            let first = status.state == CallState::AwaitingConnectivity;
            if first {
                status.state = CallState::Connected;
            }
            first
        };

        if became_connected {
            self.watchdog.lock().disarm();
            if let Some(media) = self.media.lock().as_mut() {
                media.start(&self.span);
            }
            tracing::info!(target = "buoy.call", ?state, "call connected");
        }
        Step::ClearGrace
    }

    async fn apply_candidate(&self, engine: &dyn EngineHandle, remote: TranslatedCandidate) {
        if self.is_terminal() {
            return;
        }
        match engine.add_remote_candidate(&remote).await {
            Ok(()) => tracing::trace!(target = "buoy.call", candidate = %remote.line, "remote candidate applied"),
            Err(err) => tracing::warn!(target = "buoy.call", error = %err, "dropping remote candidate"),
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}
