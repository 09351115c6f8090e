//! Peer id to call session map, and every operation that mutates it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::Instrument;

use super::session::{CallSession, CallState, EndReason, Halted, SessionConfig};
use crate::candidate::{self, CandidateError};
use crate::credentials::IceServerConfig;
use crate::engine::NegotiationEngine;
use crate::media::MediaSource;
use crate::protocol::{SdpType, SessionDescription, WireCandidate};
use crate::transport::SignalSender;

/// What to do with an offer from a peer that already has a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateOfferPolicy {
    /// Tear the old session down and answer the new offer.
    #[default]
    Replace,
    /// Keep the old session and drop the new offer.
    Ignore,
}

impl FromStr for DuplicateOfferPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "ignore" => Ok(Self::Ignore),
            other => Err(format!("unknown duplicate offer policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionLimit {
    #[default]
    Unbounded,
    AtMost(usize),
}

impl SessionLimit {
    /// `0` means unbounded.
    pub fn from_max(max: usize) -> Self {
        if max == 0 {
            Self::Unbounded
        } else {
            Self::AtMost(max)
        }
    }

    fn admits(self, live: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::AtMost(max) => live < max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub connect_timeout: Duration,
    pub disconnect_grace: Duration,
    pub limit: SessionLimit,
    pub duplicate_offers: DuplicateOfferPolicy,
    pub media_path: PathBuf,
    pub display_name: String,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            disconnect_grace: Duration::from_secs(3),
            limit: SessionLimit::Unbounded,
            duplicate_offers: DuplicateOfferPolicy::Replace,
            media_path: PathBuf::from("media/sample"),
            display_name: "WebRTC Bot".to_string(),
        }
    }
}

#[derive(Clone)]
struct Link {
    outbound: SignalSender,
    ice_servers: Vec<IceServerConfig>,
}

struct Inner {
    sessions: Mutex<HashMap<String, Arc<CallSession>>>,
    engine: Arc<dyn NegotiationEngine>,
    media: Arc<dyn MediaSource>,
    settings: CallSettings,
    generation: AtomicU64,
    link: Mutex<Option<Link>>,
}

/// Lets a session ask for its own teardown without holding the manager alive.
#[derive(Clone)]
pub struct ExitHandle {
    inner: Weak<Inner>,
    peer_id: String,
    generation: u64,
}

impl ExitHandle {
    /// Schedules teardown of this exact session generation. A newer session
    /// for the same peer is never affected.
    pub fn request(&self, reason: EndReason) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let manager = CallManager { inner };
        let peer_id = self.peer_id.clone();
        let generation = self.generation;
        tokio::spawn(
            async move {
                manager
                    .teardown_generation(&peer_id, Some(generation), reason)
                    .await;
            }
            .in_current_span(),
        );
    }
}

enum Admission {
    Fresh,
    Replace,
    Reject(&'static str),
}

enum Placement {
    Inserted {
        displaced: Option<(Arc<CallSession>, Halted)>,
        live: usize,
    },
    Rejected(&'static str),
}

#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

impl CallManager {
    pub fn new(
        engine: Arc<dyn NegotiationEngine>,
        media: Arc<dyn MediaSource>,
        settings: CallSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                engine,
                media,
                settings,
                generation: AtomicU64::new(0),
                link: Mutex::new(None),
            }),
        }
    }

    /// Points new sessions at the current signaling connection and relay servers.
    pub fn bind(&self, outbound: SignalSender, ice_servers: Vec<IceServerConfig>) {
        *self.inner.link.lock() = Some(Link {
            outbound,
            ice_servers,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<CallSession>> {
        self.inner.sessions.lock().get(peer_id).cloned()
    }

    pub fn session_state(&self, peer_id: &str) -> Option<CallState> {
        self.session(peer_id).map(|session| session.state())
    }

    pub fn peers(&self) -> Vec<String> {
        self.inner.sessions.lock().keys().cloned().collect()
    }

    pub async fn handle_offer(&self, peer_id: &str, offer: SessionDescription) {
        let Some(link) = self.inner.link.lock().clone() else {
            tracing::warn!(target = "buoy.call", peer_id = %peer_id, "offer received before signaling was bound");
            return;
        };
        if offer.kind != SdpType::Offer {
            tracing::warn!(target = "buoy.call", peer_id = %peer_id, kind = ?offer.kind, "ignoring non-offer description");
            return;
        }

        match self.admission(peer_id) {
            Admission::Reject(why) => {
                tracing::warn!(target = "buoy.call", peer_id = %peer_id, "offer dropped: {why}");
                return;
            }
            Admission::Replace => {
                tracing::info!(target = "buoy.call", peer_id = %peer_id, "replacing live session with new offer");
                self.teardown_generation(peer_id, None, EndReason::Replaced)
                    .await;
            }
            Admission::Fresh => {}
        }

        let (engine, events) = match self.inner.engine.create_handle(&link.ice_servers).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(target = "buoy.call", peer_id = %peer_id, error = %err, "failed to create engine handle");
                return;
            }
        };

        let settings = &self.inner.settings;
        let media = match self.inner.media.open(&settings.media_path) {
            Ok(Some(media)) => Some(media),
            Ok(None) => {
                tracing::debug!(target = "buoy.call", peer_id = %peer_id, path = %settings.media_path.display(), "no media found; answering without tracks");
                None
            }
            Err(err) => {
                tracing::warn!(target = "buoy.call", peer_id = %peer_id, error = %err, "media unavailable; answering without tracks");
                None
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = CallSession::new(
            peer_id.to_string(),
            generation,
            SessionConfig {
                connect_timeout: settings.connect_timeout,
                disconnect_grace: settings.disconnect_grace,
                display_name: settings.display_name.clone(),
            },
            engine,
            events,
            media,
            link.outbound,
            ExitHandle {
                inner: Arc::downgrade(&self.inner),
                peer_id: peer_id.to_string(),
                generation,
            },
        );

        match self.place(peer_id, &session, offer) {
            Placement::Inserted { displaced, live } => {
                tracing::info!(target = "buoy.call", peer_id = %peer_id, call = generation, sessions = live, "call session created");
                if let Some((old, halted)) = displaced {
                    old.finish(halted).await;
                }
            }
            Placement::Rejected(why) => {
                tracing::warn!(target = "buoy.call", peer_id = %peer_id, "offer dropped: {why}");
                session.close(EndReason::Declined).await;
            }
        }
    }

    fn admission(&self, peer_id: &str) -> Admission {
        let sessions = self.inner.sessions.lock();
        match sessions.get(peer_id) {
            Some(existing) if !existing.is_terminal() => match self.inner.settings.duplicate_offers {
                DuplicateOfferPolicy::Ignore => Admission::Reject("duplicate offer for live session"),
                DuplicateOfferPolicy::Replace => Admission::Replace,
            },
            Some(_) => Admission::Replace,
            None if !self.inner.settings.limit.admits(sessions.len()) => {
                Admission::Reject("session limit reached")
            }
            None => Admission::Fresh,
        }
    }

    /// Re-checks admission and starts the session under the map lock, so the
    /// map never holds two live sessions for one peer. A displaced session is
    /// halted before its replacement starts; only its engine close is left to
    /// the caller.
    fn place(
        &self,
        peer_id: &str,
        session: &Arc<CallSession>,
        offer: SessionDescription,
    ) -> Placement {
        let mut sessions = self.inner.sessions.lock();
        match sessions.get(peer_id) {
            Some(existing)
                if !existing.is_terminal()
                    && self.inner.settings.duplicate_offers == DuplicateOfferPolicy::Ignore =>
            {
                return Placement::Rejected("duplicate offer for live session");
            }
            Some(_) => {}
            None if !self.inner.settings.limit.admits(sessions.len()) => {
                return Placement::Rejected("session limit reached");
            }
            None => {}
        }
        let displaced = sessions.remove(peer_id).and_then(|old| {
            let halted = old.halt(EndReason::Replaced)?;
            Some((old, halted))
        });
        session.start(offer);
        sessions.insert(peer_id.to_string(), Arc::clone(session));
        Placement::Inserted {
            displaced,
            live: sessions.len(),
        }
    }

    /// Forwards a remote candidate to the peer's live session. Unknown peers
    /// and untranslatable candidates are dropped.
    pub async fn handle_candidate(&self, peer_id: &str, candidate: Option<WireCandidate>) {
        let Some(wire) = candidate else {
            tracing::trace!(target = "buoy.call", peer_id = %peer_id, "remote end of candidates");
            return;
        };
        let Some(session) = self.session(peer_id) else {
            tracing::debug!(target = "buoy.call", peer_id = %peer_id, "candidate for unknown peer dropped");
            return;
        };
        match candidate::translate(&wire) {
            Ok(translated) => {
                if !session.enqueue_candidate(translated) {
                    tracing::debug!(target = "buoy.call", peer_id = %peer_id, "session ended; candidate dropped");
                }
            }
            Err(CandidateError::EndOfCandidates) => {
                tracing::trace!(target = "buoy.call", peer_id = %peer_id, "remote end of candidates");
            }
            Err(err) => {
                tracing::warn!(target = "buoy.call", peer_id = %peer_id, error = %err, "dropping untranslatable candidate");
            }
        }
    }

    pub async fn handle_hangup(&self, peer_id: &str) -> bool {
        self.teardown_generation(peer_id, None, EndReason::Hangup)
            .await
    }

    pub async fn handle_user_left(&self, peer_id: &str) -> bool {
        self.teardown_generation(peer_id, None, EndReason::UserLeft)
            .await
    }

    /// Removes and closes the peer's session. With `generation` set, only that
    /// exact session is affected. A timeout never removes a connected session.
    pub async fn teardown_generation(
        &self,
        peer_id: &str,
        generation: Option<u64>,
        reason: EndReason,
    ) -> bool {
        let (removed, remaining) = {
            let mut sessions = self.inner.sessions.lock();
            let matches = sessions.get(peer_id).is_some_and(|session| {
                generation.is_none_or(|generation| session.generation() == generation)
                    && !(reason == EndReason::Timeout && session.state() == CallState::Connected)
            });
            let removed = if matches {
                sessions.remove(peer_id)
            } else {
                None
            };
            (removed, sessions.len())
        };

        let Some(session) = removed else {
            return false;
        };
        let closed = session.close(reason).await;
        tracing::info!(
            target = "buoy.call",
            peer_id = %peer_id,
            call = session.generation(),
            reason = %reason,
            sessions = remaining,
            "call session removed"
        );
        closed
    }

    /// Tears down every live session. Returns how many were removed.
    pub async fn teardown_all(&self) -> usize {
        let drained: Vec<Arc<CallSession>> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        if drained.is_empty() {
            return 0;
        }
        join_all(
            drained
                .iter()
                .map(|session| session.close(EndReason::Reconnect)),
        )
        .await;
        tracing::info!(target = "buoy.call", count = drained.len(), "tore down all call sessions");
        drained.len()
    }
}
