//! In-memory transport for negotiation tests.
//!
//! Follows the browser signaling-state rules closely enough to catch
//! out-of-order calls. Its "SDP" is the JSON list of attached senders, so the
//! receiving fake can report remote tracks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::description::{IceCandidate, SdpKind, SessionDescription};
use super::session::NegotiationState;
use super::transport::{
    PeerEventSink, PeerTransport, RemoteTrackInfo, TransceiverDirection, TransportEvent,
    TransportFactory,
};
use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::media::{MediaKind, MediaTrack};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FakeTrack {
    id: String,
    stream_id: String,
    kind: MediaKind,
    send_only: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct FakeSdp {
    origin: String,
    version: u64,
    tracks: Vec<FakeTrack>,
}

#[derive(Default)]
struct FakeInner {
    signaling: Option<NegotiationState>,
    version: u64,
    pending_local: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    senders: Vec<FakeTrack>,
    applied_candidates: Vec<IceCandidate>,
    seen_remote: HashSet<String>,
    offers_created: usize,
    remote_offers: usize,
    close_calls: usize,
    fail_next_answer: bool,
}

impl FakeInner {
    fn state(&self) -> NegotiationState {
        self.signaling.unwrap_or(NegotiationState::Stable)
    }
}

pub(crate) struct FakeTransport {
    origin: String,
    events: PeerEventSink,
    inner: Mutex<FakeInner>,
}

impl FakeTransport {
    pub(crate) fn new(events: PeerEventSink) -> Self {
        Self {
            origin: uuid::Uuid::new_v4().to_string(),
            events,
            inner: Mutex::new(FakeInner::default()),
        }
    }

    /// Transport whose events go nowhere
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(PeerEventSink::new("remote", 0, tx))
    }

    fn describe(&self, inner: &mut FakeInner) -> Result<String> {
        inner.version += 1;
        let sdp = FakeSdp {
            origin: self.origin.clone(),
            version: inner.version,
            tracks: inner.senders.clone(),
        };
        Ok(serde_json::to_string(&sdp)?)
    }

    fn wrong_state(op: &str, state: NegotiationState) -> Error {
        Error::Negotiation(format!("{} not allowed in {}", op, state))
    }

    pub(crate) fn signaling(&self) -> NegotiationState {
        self.inner.lock().state()
    }

    pub(crate) fn force_state(&self, state: NegotiationState) {
        self.inner.lock().signaling = Some(state);
    }

    pub(crate) fn current_local(&self) -> Option<SessionDescription> {
        self.inner.lock().current_local.clone()
    }

    pub(crate) fn current_remote(&self) -> Option<SessionDescription> {
        self.inner.lock().current_remote.clone()
    }

    pub(crate) fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().applied_candidates.clone()
    }

    pub(crate) fn offers_created(&self) -> usize {
        self.inner.lock().offers_created
    }

    /// Offers accepted from the remote side
    pub(crate) fn remote_offers(&self) -> usize {
        self.inner.lock().remote_offers
    }

    pub(crate) fn sender_track_ids_now(&self) -> Vec<String> {
        self.inner.lock().senders.iter().map(|t| t.id.clone()).collect()
    }

    pub(crate) fn sender_is_send_only(&self, track_id: &str) -> bool {
        self.inner
            .lock()
            .senders
            .iter()
            .any(|t| t.id == track_id && t.send_only)
    }

    /// Make the next `create_answer` fail
    pub(crate) fn fail_next_answer(&self) {
        self.inner.lock().fail_next_answer = true;
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.inner.lock().close_calls
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().close_calls > 0
    }

    fn report_remote_tracks(&self, inner: &mut FakeInner, desc: &SessionDescription) {
        // Descriptions that are not fake JSON carry no tracks
        let Ok(sdp) = serde_json::from_str::<FakeSdp>(&desc.sdp) else {
            return;
        };
        for track in sdp.tracks {
            if !inner.seen_remote.insert(track.id.clone()) {
                continue;
            }
            self.events.emit(TransportEvent::RemoteTrack(RemoteTrackInfo {
                track_id: track.id,
                stream_id: track.stream_id,
                kind: track.kind,
                direction: if track.send_only {
                    TransceiverDirection::RecvOnly
                } else {
                    TransceiverDirection::SendRecv
                },
            }));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock();
        if inner.close_calls > 0 {
            return Err(Error::Negotiation("transport closed".into()));
        }
        inner.offers_created += 1;
        let sdp = self.describe(&mut inner)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock();
        if inner.state() != NegotiationState::HaveRemoteOffer {
            return Err(Self::wrong_state("create_answer", inner.state()));
        }
        if std::mem::take(&mut inner.fail_next_answer) {
            return Err(Error::Negotiation("answer generation failed".into()));
        }
        let sdp = self.describe(&mut inner)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state();
        match (desc.kind, state) {
            (SdpKind::Offer, NegotiationState::Stable) => {
                inner.pending_local = Some(desc);
                inner.signaling = Some(NegotiationState::HaveLocalOffer);
            }
            (SdpKind::Answer, NegotiationState::HaveRemoteOffer) => {
                inner.current_remote = inner.pending_remote.take();
                inner.current_local = Some(desc);
                inner.signaling = Some(NegotiationState::Stable);
            }
            (SdpKind::Rollback, NegotiationState::HaveLocalOffer) => {
                inner.pending_local = None;
                inner.signaling = Some(NegotiationState::Stable);
            }
            (SdpKind::Rollback, NegotiationState::HaveRemoteOffer) => {
                inner.pending_remote = None;
                inner.signaling = Some(NegotiationState::Stable);
            }
            (kind, state) => {
                return Err(Self::wrong_state(&format!("set_local({:?})", kind), state))
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state();
        match (desc.kind, state) {
            (SdpKind::Offer, NegotiationState::Stable) => {
                inner.remote_offers += 1;
                self.report_remote_tracks(&mut inner, &desc);
                inner.pending_remote = Some(desc);
                inner.signaling = Some(NegotiationState::HaveRemoteOffer);
            }
            (SdpKind::Answer, NegotiationState::HaveLocalOffer) => {
                self.report_remote_tracks(&mut inner, &desc);
                inner.current_local = inner.pending_local.take();
                inner.current_remote = Some(desc);
                inner.signaling = Some(NegotiationState::Stable);
            }
            (kind, state) => {
                return Err(Self::wrong_state(&format!("set_remote({:?})", kind), state))
            }
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        let inner = self.inner.lock();
        inner.current_remote.is_some() || inner.pending_remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.current_remote.is_none() && inner.pending_remote.is_none() {
            return Err(Error::Negotiation("remote description not set".into()));
        }
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack, send_only: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.senders.iter().any(|t| t.id == track.id()) {
            return Err(Error::Media(format!("track {} already attached", track.id())));
        }
        inner.senders.push(FakeTrack {
            id: track.id().to_string(),
            stream_id: track.stream_id().to_string(),
            kind: track.kind(),
            send_only,
        });
        Ok(())
    }

    async fn replace_track(&self, old_track_id: &str, track: &MediaTrack) -> Result<()> {
        let mut inner = self.inner.lock();
        let sender = inner
            .senders
            .iter_mut()
            .find(|t| t.id == old_track_id)
            .ok_or_else(|| Error::Media(format!("no sender for track {}", old_track_id)))?;
        sender.id = track.id().to_string();
        sender.stream_id = track.stream_id().to_string();
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        self.inner.lock().senders.retain(|t| t.id != track_id);
        Ok(())
    }

    async fn sender_track_ids(&self) -> Vec<String> {
        self.sender_track_ids_now()
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().close_calls += 1;
        self.events
            .emit(TransportEvent::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}

/// Hands out fake transports and keeps them reachable by remote id
#[derive(Default)]
pub(crate) struct FakeFactory {
    transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub(crate) fn get(&self, remote_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports.lock().get(remote_id).cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
        let remote_id = events.remote_id().to_string();
        let transport = Arc::new(FakeTransport::new(events));
        self.transports.lock().insert(remote_id, Arc::clone(&transport));
        Ok(transport)
    }
}
