//! Underlying peer-connection abstraction and its webrtc-rs implementation

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::description::{IceCandidate, SessionDescription};
use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::media::{MediaKind, MediaTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl From<RTCRtpTransceiverDirection> for TransceiverDirection {
    fn from(direction: RTCRtpTransceiverDirection) -> Self {
        match direction {
            RTCRtpTransceiverDirection::Sendonly => TransceiverDirection::SendOnly,
            RTCRtpTransceiverDirection::Recvonly => TransceiverDirection::RecvOnly,
            RTCRtpTransceiverDirection::Inactive => TransceiverDirection::Inactive,
            _ => TransceiverDirection::SendRecv,
        }
    }
}

/// Inbound track as seen by the local side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Direction of the local transceiver carrying the track
    pub direction: TransceiverDirection,
}

/// Something the underlying connection reports on its own
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrackInfo),
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub remote_id: String,
    /// Distinguishes successive sessions with the same remote
    pub session: u64,
    pub event: TransportEvent,
}

/// Tags transport events with the session they belong to
#[derive(Clone)]
pub struct PeerEventSink {
    remote_id: String,
    session: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(remote_id: impl Into<String>, session: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote_id: remote_id.into(),
            session,
            tx,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn emit(&self, event: TransportEvent) {
        let event = PeerEvent {
            remote_id: self.remote_id.clone(),
            session: self.session,
            event,
        };
        if self.tx.send(event).is_err() {
            trace!("Peer event for {} dropped, manager gone", self.remote_id);
        }
    }
}

/// One underlying peer connection. Mirrors the browser primitives the
/// negotiation state machine is layered on.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    /// Also accepts a rollback description.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Attach a local track; `send_only` gives it a dedicated send-only transceiver.
    async fn add_track(&self, track: &MediaTrack, send_only: bool) -> Result<()>;
    /// Swap the track on an existing sender without renegotiating.
    async fn replace_track(&self, old_track_id: &str, track: &MediaTrack) -> Result<()>;
    async fn remove_track(&self, track_id: &str) -> Result<()>;
    /// Ids of the tracks currently attached to senders
    async fn sender_track_ids(&self) -> Vec<String>;
    async fn close(&self) -> Result<()>;
}

/// Builds one transport per remote participant
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>>;
}

pub struct WebRtcTransport {
    remote_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl WebRtcTransport {
    pub async fn new(config: &ClientConfig, events: PeerEventSink) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
        let remote_id = events.remote_id().to_string();

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    info!("Peer {} connection state: {}", sink.remote_id(), s);
                    sink.emit(TransportEvent::StateChanged(s.into()));
                })
            },
        ));

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        debug!("Local ICE candidate for {}: {}", sink.remote_id(), init.candidate);
                        sink.emit(TransportEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    sink.emit(TransportEvent::RemoteTrack(RemoteTrackInfo {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        direction: transceiver.direction().into(),
                    }));
                })
            },
        ));

        Ok(Self {
            remote_id,
            peer_connection,
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Drain RTCP so interceptors keep running for this sender
    fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>) {
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        SessionDescription::try_from(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        SessionDescription::try_from(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.peer_connection.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.peer_connection.set_remote_description(desc).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack, send_only: bool) -> Result<()> {
        let sender = if send_only {
            let transceiver = self
                .peer_connection
                .add_transceiver_from_track(
                    track.rtp_track(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            transceiver.sender().await
        } else {
            self.peer_connection.add_track(track.rtp_track()).await?
        };

        Self::spawn_rtcp_reader(Arc::clone(&sender));
        self.senders
            .lock()
            .await
            .insert(track.id().to_string(), sender);

        debug!(
            "Track {} attached for {} (send-only: {})",
            track.id(),
            self.remote_id,
            send_only
        );
        Ok(())
    }

    async fn replace_track(&self, old_track_id: &str, track: &MediaTrack) -> Result<()> {
        let mut senders = self.senders.lock().await;
        let sender = senders
            .remove(old_track_id)
            .ok_or_else(|| Error::Media(format!("no sender for track {}", old_track_id)))?;

        if let Err(e) = sender.replace_track(Some(track.rtp_track())).await {
            senders.insert(old_track_id.to_string(), sender);
            return Err(e.into());
        }
        senders.insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = self.senders.lock().await.remove(track_id);
        if let Some(sender) = sender {
            self.peer_connection.remove_track(&sender).await?;
        }
        Ok(())
    }

    async fn sender_track_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in self.peer_connection.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_string());
            }
        }
        ids
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().await.clear();
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Creates `WebRtcTransport`s from the participant configuration
pub struct WebRtcTransportFactory {
    config: ClientConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
        Ok(Arc::new(WebRtcTransport::new(&self.config, events).await?))
    }
}
