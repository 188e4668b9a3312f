//! Per-remote negotiation state machine
//!
//! Implements polite/impolite collision handling on top of one
//! [`PeerTransport`]. Steps on one session are serialized by its lock; a
//! collision is two ends of a pair offering at once, and is resolved by role.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::classify::{classify_remote_track, ClassifyContext, RemoteTrackKind};
use super::description::{IceCandidate, SdpKind, SessionDescription};
use super::transport::{PeerTransport, RemoteTrackInfo};
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::error::{Error, Result};
use crate::media::MediaTrack;

/// Signaling sub-state, mirroring the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Stable => write!(f, "stable"),
            NegotiationState::HaveLocalOffer => write!(f, "have-local-offer"),
            NegotiationState::HaveRemoteOffer => write!(f, "have-remote-offer"),
        }
    }
}

/// Collision tie-break role. The polite side yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Polite,
    Impolite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Offer accepted. `renegotiate` is set when a local offer was rolled
    /// back to accept it and must be re-sent once the answer is out.
    Answered {
        answer: SessionDescription,
        renegotiate: bool,
    },
    /// Colliding offer dropped by the impolite side
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// `renegotiate` is set when an offer was deferred while this one was
    /// in flight; the caller should run a repair to send it.
    Applied { renegotiate: bool },
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
}

struct SessionInner {
    state: NegotiationState,
    /// Candidates received before any remote description, in receipt order
    pending_candidates: VecDeque<IceCandidate>,
    /// Local tracks attached to this session
    published: Vec<Arc<MediaTrack>>,
    announced_screen_streams: Vec<String>,
    remote_camera_stream: Option<String>,
    /// An offer was wanted while negotiation was in flight
    renegotiation_owed: bool,
    closed: bool,
}

pub struct PeerSession {
    remote_id: String,
    role: PeerRole,
    transport: Arc<dyn PeerTransport>,
    monitor: ConnectionMonitor,
    inner: Mutex<SessionInner>,
}

impl PeerSession {
    pub fn new(remote_id: impl Into<String>, role: PeerRole, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            remote_id: remote_id.into(),
            role,
            transport,
            monitor: ConnectionMonitor::new(),
            inner: Mutex::new(SessionInner {
                state: NegotiationState::Stable,
                pending_candidates: VecDeque::new(),
                published: Vec::new(),
                announced_screen_streams: Vec::new(),
                remote_camera_stream: None,
                renegotiation_owed: false,
                closed: false,
            }),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.state
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    /// Ids of the local tracks attached to this session
    pub async fn published_track_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .published
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }

    fn set_state(&self, inner: &mut SessionInner, state: NegotiationState) {
        if inner.state != state {
            debug!("Session {}: {} -> {}", self.remote_id, inner.state, state);
        }
        inner.state = state;
        self.monitor.update_negotiation(state);
    }

    fn ensure_open(&self, inner: &SessionInner) -> Result<()> {
        if inner.closed {
            return Err(Error::SessionClosed(self.remote_id.clone()));
        }
        Ok(())
    }

    /// Create and apply a local offer. Only allowed from `stable`.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        self.offer_locked(&mut inner).await
    }

    async fn offer_locked(&self, inner: &mut SessionInner) -> Result<SessionDescription> {
        self.ensure_open(inner)?;
        if inner.state != NegotiationState::Stable {
            return Err(Error::OfferAlreadyPending { state: inner.state });
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.set_state(inner, NegotiationState::HaveLocalOffer);
        inner.renegotiation_owed = false;

        debug!("Offer created for {}", self.remote_id);
        Ok(offer)
    }

    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<OfferOutcome> {
        if offer.kind != SdpKind::Offer {
            return Err(Error::Negotiation(format!(
                "expected offer from {}, got {:?}",
                self.remote_id, offer.kind
            )));
        }

        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if inner.state != NegotiationState::Stable {
            match self.role {
                PeerRole::Impolite => {
                    info!(
                        "Offer collision with {} in {}: ignoring incoming offer",
                        self.remote_id, inner.state
                    );
                    return Ok(OfferOutcome::Ignored);
                }
                PeerRole::Polite => {
                    info!(
                        "Offer collision with {} in {}: rolling back",
                        self.remote_id, inner.state
                    );
                    if inner.state == NegotiationState::HaveLocalOffer {
                        inner.renegotiation_owed = true;
                    }
                    self.transport
                        .set_local_description(SessionDescription::rollback())
                        .await?;
                    self.set_state(&mut inner, NegotiationState::Stable);
                }
            }
        }

        self.transport.set_remote_description(offer).await?;
        self.set_state(&mut inner, NegotiationState::HaveRemoteOffer);
        self.flush_candidates(&mut inner).await;

        let answer = match self.answer_remote_offer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Answering {} failed, rolling back: {}", self.remote_id, e);
                if let Err(rollback) = self
                    .transport
                    .set_local_description(SessionDescription::rollback())
                    .await
                {
                    warn!("Rollback for {} failed: {}", self.remote_id, rollback);
                }
                self.set_state(&mut inner, NegotiationState::Stable);
                return Err(e);
            }
        };
        self.set_state(&mut inner, NegotiationState::Stable);

        debug!("Answer created for {}", self.remote_id);
        Ok(OfferOutcome::Answered {
            answer,
            renegotiate: inner.renegotiation_owed,
        })
    }

    async fn answer_remote_offer(&self) -> Result<SessionDescription> {
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Apply an answer. Outside `have-local-offer` the answer is stale and dropped.
    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<AnswerOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if inner.state != NegotiationState::HaveLocalOffer {
            debug!(
                "Stale answer from {} discarded in {}",
                self.remote_id, inner.state
            );
            return Ok(AnswerOutcome::Stale);
        }
        if answer.kind != SdpKind::Answer && answer.kind != SdpKind::Pranswer {
            return Err(Error::Negotiation(format!(
                "expected answer from {}, got {:?}",
                self.remote_id, answer.kind
            )));
        }

        self.transport.set_remote_description(answer).await?;
        self.set_state(&mut inner, NegotiationState::Stable);
        self.flush_candidates(&mut inner).await;
        Ok(AnswerOutcome::Applied {
            renegotiate: inner.renegotiation_owed,
        })
    }

    pub async fn handle_ice_candidate(&self, candidate: IceCandidate) -> Result<CandidateOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if !self.transport.has_remote_description().await {
            inner.pending_candidates.push_back(candidate);
            debug!(
                "Queued ICE candidate for {} ({} pending)",
                self.remote_id,
                inner.pending_candidates.len()
            );
            return Ok(CandidateOutcome::Queued);
        }

        self.transport.add_ice_candidate(candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    async fn flush_candidates(&self, inner: &mut SessionInner) {
        if inner.pending_candidates.is_empty() {
            return;
        }
        debug!(
            "Flushing {} queued ICE candidate(s) for {}",
            inner.pending_candidates.len(),
            self.remote_id
        );
        while let Some(candidate) = inner.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Queued ICE candidate for {} rejected: {}", self.remote_id, e);
            }
        }
    }

    /// Attach camera/microphone tracks. Screen tracks are ignored here.
    pub async fn add_local_stream(&self, tracks: &[Arc<MediaTrack>]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        for track in tracks.iter().filter(|t| !t.source().is_screen()) {
            if inner.published.iter().any(|p| p.id() == track.id()) {
                continue;
            }
            self.transport.add_track(track, false).await?;
            inner.published.push(Arc::clone(track));
        }
        Ok(())
    }

    /// Attach screen tracks on send-only transceivers and produce exactly one
    /// renegotiation offer. While another exchange is in flight the tracks are
    /// attached, `OfferAlreadyPending` is returned and the offer is owed until
    /// the session is stable again.
    pub async fn add_screen_stream(&self, tracks: &[Arc<MediaTrack>]) -> Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        for track in tracks {
            if inner.published.iter().any(|p| p.id() == track.id()) {
                continue;
            }
            self.transport.add_track(track, true).await?;
            inner.published.push(Arc::clone(track));
        }

        if inner.state != NegotiationState::Stable {
            inner.renegotiation_owed = true;
        }
        self.offer_locked(&mut inner).await
    }

    /// Detach screen tracks. No offer is produced. Returns how many were detached.
    pub async fn remove_screen_stream(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let screen: Vec<Arc<MediaTrack>> = inner
            .published
            .iter()
            .filter(|t| t.source().is_screen())
            .cloned()
            .collect();

        for track in &screen {
            self.transport.remove_track(track.id()).await?;
        }
        inner.published.retain(|t| !t.source().is_screen());
        Ok(screen.len())
    }

    /// Swap a published track in place, without renegotiation
    pub async fn update_media_track(&self, old_track_id: &str, track: Arc<MediaTrack>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let pos = inner
            .published
            .iter()
            .position(|p| p.id() == old_track_id)
            .ok_or_else(|| {
                Error::Media(format!(
                    "track {} not published to {}",
                    old_track_id, self.remote_id
                ))
            })?;

        self.transport.replace_track(old_track_id, &track).await?;
        inner.published[pos] = track;
        Ok(())
    }

    /// Make sure every given local track is attached to a sender, replacing a
    /// stale track of the same source or adding a missing one. Returns an
    /// offer when the session is idle and something changed, `force` is set,
    /// or an earlier offer is owed. Otherwise a wanted offer stays owed.
    pub async fn repair(&self, tracks: &[Arc<MediaTrack>], force: bool) -> Result<Option<SessionDescription>> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let attached: HashSet<String> = self.transport.sender_track_ids().await.into_iter().collect();
        let mut changed = false;

        for track in tracks {
            if attached.contains(track.id()) {
                if !inner.published.iter().any(|p| p.id() == track.id()) {
                    inner.published.push(Arc::clone(track));
                }
                continue;
            }

            let stale = inner
                .published
                .iter()
                .position(|p| p.source() == track.source() && attached.contains(p.id()));

            match stale {
                Some(pos) => {
                    let old_id = inner.published[pos].id().to_string();
                    debug!(
                        "Repair {}: replacing {} with {}",
                        self.remote_id,
                        old_id,
                        track.id()
                    );
                    self.transport.replace_track(&old_id, track).await?;
                    inner.published[pos] = Arc::clone(track);
                }
                None => {
                    debug!("Repair {}: attaching missing {}", self.remote_id, track.id());
                    self.transport
                        .add_track(track, track.source().is_screen())
                        .await?;
                    inner.published.retain(|p| p.id() != track.id());
                    inner.published.push(Arc::clone(track));
                }
            }
            changed = true;
        }

        if !(changed || force || inner.renegotiation_owed) {
            return Ok(None);
        }
        if inner.state != NegotiationState::Stable {
            inner.renegotiation_owed = true;
            debug!(
                "Repair {}: negotiation in flight ({}), offer owed",
                self.remote_id, inner.state
            );
            return Ok(None);
        }

        self.offer_locked(&mut inner).await.map(Some)
    }

    /// Record a stream id the remote announced as a screen share
    pub async fn mark_remote_screen_stream(&self, stream_id: impl Into<String>) {
        let stream_id = stream_id.into();
        let mut inner = self.inner.lock().await;
        if !inner.announced_screen_streams.contains(&stream_id) {
            inner.announced_screen_streams.push(stream_id);
        }
    }

    pub async fn clear_remote_screen_streams(&self) {
        self.inner.lock().await.announced_screen_streams.clear();
    }

    pub async fn classify_remote_track(&self, info: &RemoteTrackInfo) -> RemoteTrackKind {
        let mut inner = self.inner.lock().await;
        let kind = classify_remote_track(
            info,
            ClassifyContext {
                announced_screen_streams: &inner.announced_screen_streams,
                camera_stream: inner.remote_camera_stream.as_deref(),
            },
        );
        if kind == RemoteTrackKind::Camera && inner.remote_camera_stream.is_none() {
            inner.remote_camera_stream = Some(info.stream_id.clone());
        }
        kind
    }

    /// Tear down the underlying connection. Shared local tracks are left
    /// running; their owner stops them. Calling twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.pending_candidates.clear();
        inner.published.clear();
        drop(inner);

        info!("Closing session with {}", self.remote_id);
        self.monitor.update_state(ConnectionState::Closed);
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::peer::fake::FakeTransport;

    fn session(role: PeerRole) -> (PeerSession, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::detached());
        let session = PeerSession::new("remote", role, transport.clone() as Arc<dyn PeerTransport>);
        (session, transport)
    }

    fn track(source: TrackSource, id: &str, stream: &str) -> Arc<MediaTrack> {
        Arc::new(MediaTrack::new(source, id, stream))
    }

    async fn connected_pair() -> (PeerSession, Arc<FakeTransport>, PeerSession, Arc<FakeTransport>) {
        let (a, ta) = session(PeerRole::Impolite);
        let (b, tb) = session(PeerRole::Polite);
        let offer = a.create_offer().await.unwrap();
        let OfferOutcome::Answered { answer, .. } = b.handle_offer(offer).await.unwrap() else {
            panic!("polite side must answer");
        };
        assert_eq!(
            a.handle_answer(answer).await.unwrap(),
            AnswerOutcome::Applied { renegotiate: false }
        );
        (a, ta, b, tb)
    }

    #[tokio::test]
    async fn test_offer_only_from_stable() {
        let (s, _) = session(PeerRole::Impolite);
        s.create_offer().await.unwrap();
        assert_eq!(s.state().await, NegotiationState::HaveLocalOffer);

        let err = s.create_offer().await.unwrap_err();
        assert!(matches!(
            err,
            Error::OfferAlreadyPending {
                state: NegotiationState::HaveLocalOffer
            }
        ));
    }

    #[tokio::test]
    async fn test_basic_exchange_reaches_stable() {
        let (a, ta, b, tb) = connected_pair().await;
        assert_eq!(a.state().await, NegotiationState::Stable);
        assert_eq!(b.state().await, NegotiationState::Stable);
        assert_eq!(ta.current_local(), tb.current_remote());
        assert_eq!(tb.current_local(), ta.current_remote());
    }

    #[tokio::test]
    async fn test_glare_impolite_offer_wins() {
        let (a, ta) = session(PeerRole::Impolite);
        let (b, tb) = session(PeerRole::Polite);

        let offer_a = a.create_offer().await.unwrap();
        let offer_b = b.create_offer().await.unwrap();

        // Both offers cross on the wire
        let outcome_b = b.handle_offer(offer_a.clone()).await.unwrap();
        let outcome_a = a.handle_offer(offer_b).await.unwrap();

        assert_eq!(outcome_a, OfferOutcome::Ignored);
        let OfferOutcome::Answered { answer, renegotiate } = outcome_b else {
            panic!("polite side must answer");
        };
        assert!(renegotiate);
        assert_eq!(
            a.handle_answer(answer).await.unwrap(),
            AnswerOutcome::Applied { renegotiate: false }
        );

        assert_eq!(a.state().await, NegotiationState::Stable);
        assert_eq!(b.state().await, NegotiationState::Stable);
        assert_eq!(ta.current_local(), Some(offer_a.clone()));
        assert_eq!(tb.current_remote(), Some(offer_a));
        assert_eq!(tb.signaling(), NegotiationState::Stable);

        // The rolled-back offer is re-sent by the next repair, once
        let offers = tb.offers_created();
        assert!(b.repair(&[], false).await.unwrap().is_some());
        assert_eq!(tb.offers_created(), offers + 1);
    }

    #[tokio::test]
    async fn test_failed_answer_rolls_back_to_stable() {
        let (a, _) = session(PeerRole::Polite);
        let (b, tb) = session(PeerRole::Impolite);

        tb.fail_next_answer();
        let offer = a.create_offer().await.unwrap();
        assert!(b.handle_offer(offer).await.is_err());
        assert_eq!(b.state().await, NegotiationState::Stable);
        assert_eq!(tb.signaling(), NegotiationState::Stable);

        // Later offers are not mistaken for a collision
        let (c, _) = session(PeerRole::Polite);
        let retry = c.create_offer().await.unwrap();
        assert!(matches!(
            b.handle_offer(retry).await.unwrap(),
            OfferOutcome::Answered { .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_answer_is_noop() {
        let (a, ta, _b, _) = connected_pair().await;
        let remote_before = ta.current_remote();

        let stale = SessionDescription::answer("late");
        assert_eq!(a.handle_answer(stale).await.unwrap(), AnswerOutcome::Stale);
        assert_eq!(a.state().await, NegotiationState::Stable);
        assert_eq!(ta.current_remote(), remote_before);
    }

    #[tokio::test]
    async fn test_answer_during_remote_offer_is_stale() {
        let (s, t) = session(PeerRole::Polite);
        t.force_state(NegotiationState::HaveRemoteOffer);
        {
            let mut inner = s.inner.lock().await;
            s.set_state(&mut inner, NegotiationState::HaveRemoteOffer);
        }
        let outcome = s.handle_answer(SessionDescription::answer("x")).await.unwrap();
        assert_eq!(outcome, AnswerOutcome::Stale);
        assert_eq!(s.state().await, NegotiationState::HaveRemoteOffer);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (a, _) = session(PeerRole::Impolite);
        let (b, tb) = session(PeerRole::Polite);

        let candidates: Vec<IceCandidate> = (0..5)
            .map(|i| IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", i, i)))
            .collect();
        for c in &candidates {
            assert_eq!(
                b.handle_ice_candidate(c.clone()).await.unwrap(),
                CandidateOutcome::Queued
            );
        }
        assert_eq!(b.pending_candidates().await, 5);
        assert!(tb.applied_candidates().is_empty());

        let offer = a.create_offer().await.unwrap();
        b.handle_offer(offer).await.unwrap();

        assert_eq!(b.pending_candidates().await, 0);
        assert_eq!(tb.applied_candidates(), candidates);

        let late = IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host");
        assert_eq!(
            b.handle_ice_candidate(late.clone()).await.unwrap(),
            CandidateOutcome::Applied
        );
        assert_eq!(tb.applied_candidates().last(), Some(&late));
    }

    #[tokio::test]
    async fn test_answer_flushes_queued_candidates() {
        let (a, ta) = session(PeerRole::Impolite);
        let (b, _) = session(PeerRole::Polite);

        let offer = a.create_offer().await.unwrap();
        let first = IceCandidate::new("candidate:1");
        let second = IceCandidate::new("candidate:2");
        a.handle_ice_candidate(first.clone()).await.unwrap();
        a.handle_ice_candidate(second.clone()).await.unwrap();

        let OfferOutcome::Answered { answer, .. } = b.handle_offer(offer).await.unwrap() else {
            panic!("expected answer");
        };
        a.handle_answer(answer).await.unwrap();
        assert_eq!(ta.applied_candidates(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_screen_share_offers() {
        let (a, ta, b, _) = connected_pair().await;
        let camera = track(TrackSource::Camera, "camera-1", "user-a");
        a.add_local_stream(&[camera.clone()]).await.unwrap();
        let offers_before = ta.offers_created();

        let screen = vec![track(TrackSource::Screen, "screen-video-1", "screen-a")];
        let offer = a.add_screen_stream(&screen).await.unwrap();
        assert_eq!(ta.offers_created(), offers_before + 1);
        assert!(ta.sender_is_send_only("screen-video-1"));

        let OfferOutcome::Answered { answer, .. } = b.handle_offer(offer).await.unwrap() else {
            panic!("expected answer");
        };
        a.handle_answer(answer).await.unwrap();

        let detached = a.remove_screen_stream().await.unwrap();
        assert_eq!(detached, 1);
        assert_eq!(ta.offers_created(), offers_before + 1);
        assert_eq!(a.published_track_ids().await, vec!["camera-1".to_string()]);
        assert_eq!(a.state().await, NegotiationState::Stable);
        // Detaching does not stop shared tracks
        assert!(!screen[0].is_stopped());
    }

    #[tokio::test]
    async fn test_screen_share_while_offer_pending() {
        let (a, ta) = session(PeerRole::Impolite);
        a.create_offer().await.unwrap();

        let screen = vec![track(TrackSource::Screen, "screen-video-1", "screen-a")];
        let err = a.add_screen_stream(&screen).await.unwrap_err();
        assert!(matches!(err, Error::OfferAlreadyPending { .. }));
        // Tracks stay attached for a later renegotiation
        assert!(ta.sender_track_ids_now().contains(&"screen-video-1".to_string()));
    }

    #[tokio::test]
    async fn test_deferred_screen_offer_follows_answer() {
        let (a, ta) = session(PeerRole::Impolite);
        let (b, _) = session(PeerRole::Polite);
        let pending = a.create_offer().await.unwrap();

        let screen = vec![track(TrackSource::Screen, "screen-video-1", "screen-a")];
        assert!(a.add_screen_stream(&screen).await.is_err());
        // Still in flight: nothing to send yet
        assert!(a.repair(&screen, false).await.unwrap().is_none());

        let OfferOutcome::Answered { answer, .. } = b.handle_offer(pending).await.unwrap() else {
            panic!("expected answer");
        };
        assert_eq!(
            a.handle_answer(answer).await.unwrap(),
            AnswerOutcome::Applied { renegotiate: true }
        );

        let owed = a.repair(&screen, false).await.unwrap().expect("owed offer");
        assert_eq!(ta.offers_created(), 2);
        assert!(owed.sdp.contains("screen-video-1"));

        let OfferOutcome::Answered { answer, .. } = b.handle_offer(owed).await.unwrap() else {
            panic!("expected answer");
        };
        assert_eq!(
            a.handle_answer(answer).await.unwrap(),
            AnswerOutcome::Applied { renegotiate: false }
        );
        assert!(a.repair(&screen, false).await.unwrap().is_none());
        assert_eq!(ta.offers_created(), 2);
    }

    #[tokio::test]
    async fn test_update_media_track_no_renegotiation() {
        let (a, ta, _b, _) = connected_pair().await;
        let front = track(TrackSource::Camera, "camera-user", "user-a");
        a.add_local_stream(&[front]).await.unwrap();
        let offers = ta.offers_created();

        let back = track(TrackSource::Camera, "camera-environment", "user-a");
        a.update_media_track("camera-user", back).await.unwrap();

        assert_eq!(ta.offers_created(), offers);
        assert_eq!(ta.sender_track_ids_now(), vec!["camera-environment".to_string()]);
        assert!(a.update_media_track("camera-user", track(TrackSource::Camera, "x", "y")).await.is_err());
    }

    #[tokio::test]
    async fn test_repair_attaches_missing_tracks() {
        let (a, ta) = session(PeerRole::Impolite);
        let camera = track(TrackSource::Camera, "camera-1", "user-a");
        let mic = track(TrackSource::Microphone, "microphone-1", "user-a");
        a.add_local_stream(&[camera.clone()]).await.unwrap();

        let offer = a.repair(&[camera.clone(), mic.clone()], false).await.unwrap();
        assert!(offer.is_some());
        let mut ids = ta.sender_track_ids_now();
        ids.sort();
        assert_eq!(ids, vec!["camera-1".to_string(), "microphone-1".to_string()]);

        // Negotiation in flight: nothing more to do
        assert!(a.repair(&[camera, mic], true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unchanged_repair_offers_only_when_forced() {
        let (b, tb) = session(PeerRole::Polite);
        let camera = track(TrackSource::Camera, "camera-1", "user-b");
        b.add_local_stream(&[camera.clone()]).await.unwrap();

        assert!(b.repair(&[camera.clone()], false).await.unwrap().is_none());
        assert_eq!(tb.offers_created(), 0);

        assert!(b.repair(&[camera], true).await.unwrap().is_some());
        assert_eq!(tb.offers_created(), 1);
    }

    #[tokio::test]
    async fn test_repair_idle_negotiated_session_is_quiet() {
        let (a, ta, _b, _) = connected_pair().await;
        let offers = ta.offers_created();
        assert!(a.repair(&[], false).await.unwrap().is_none());
        assert_eq!(ta.offers_created(), offers);
    }

    #[tokio::test]
    async fn test_classification_uses_marker_then_heuristics() {
        use crate::media::MediaKind;
        use crate::peer::TransceiverDirection;

        let (s, _) = session(PeerRole::Polite);
        let camera = RemoteTrackInfo {
            track_id: "t1".into(),
            stream_id: "s1".into(),
            kind: MediaKind::Video,
            direction: TransceiverDirection::SendRecv,
        };
        assert_eq!(s.classify_remote_track(&camera).await, RemoteTrackKind::Camera);

        let opaque = RemoteTrackInfo {
            track_id: "t2".into(),
            stream_id: "s2".into(),
            kind: MediaKind::Video,
            direction: TransceiverDirection::SendRecv,
        };
        assert_eq!(s.classify_remote_track(&opaque).await, RemoteTrackKind::Camera);

        s.mark_remote_screen_stream("s2").await;
        assert_eq!(s.classify_remote_track(&opaque).await, RemoteTrackKind::Screen);

        s.clear_remote_screen_streams().await;
        let recvonly = RemoteTrackInfo {
            direction: TransceiverDirection::RecvOnly,
            ..opaque
        };
        assert_eq!(s.classify_remote_track(&recvonly).await, RemoteTrackKind::Screen);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (s, t) = session(PeerRole::Polite);
        s.close().await.unwrap();
        s.close().await.unwrap();
        assert!(s.is_closed().await);
        assert!(t.is_closed());
        assert_eq!(t.close_calls(), 1);
        assert_eq!(s.monitor().current().state, ConnectionState::Closed);
        assert!(matches!(
            s.create_offer().await,
            Err(Error::SessionClosed(_))
        ));
    }
}
