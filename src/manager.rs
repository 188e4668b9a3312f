//! Local participant: one peer session per remote, plus local media
//!
//! Signaling messages and transport events are handled one at a time by
//! [`ConnectionManager::run`]. Local actions (mute, screen share, camera
//! switch) may be called concurrently from elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::error::{Error, Result};
use crate::media::{FacingMode, MediaBundle, MediaSource};
use crate::peer::{
    AnswerOutcome, IceCandidate, OfferOutcome, PeerEvent, PeerEventSink, PeerRole, PeerSession,
    RemoteTrackInfo, RemoteTrackKind, SessionDescription, TransportEvent, TransportFactory,
};
use crate::room::Role;
use crate::signaling::{decode_payload, ClientMessage, ServerMessage, SignalingSender};

/// What the UI layer is told about
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Joined {
        role: Role,
        participants: Vec<String>,
    },
    ParticipantJoined(String),
    ParticipantLeft(String),
    RemoteTrack {
        remote_id: String,
        kind: RemoteTrackKind,
        info: RemoteTrackInfo,
    },
    RemoteMediaState {
        remote_id: String,
        audio: bool,
        video: bool,
    },
    RemoteScreenShare {
        remote_id: String,
        active: bool,
    },
    /// Every stream of this remote is gone
    RemoteStreamsGone(String),
    HostChanged(String),
    ConnectionState {
        remote_id: String,
        state: ConnectionState,
    },
    SignalingError {
        code: u16,
        message: String,
    },
}

struct SessionEntry {
    id: u64,
    session: Arc<PeerSession>,
}

/// Receivers paired with a new manager
pub struct ManagerChannels {
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    pub ui_events: mpsc::UnboundedReceiver<ManagerEvent>,
}

pub struct ConnectionManager {
    local_id: String,
    config: ClientConfig,
    signaling: SignalingSender,
    factory: Arc<dyn TransportFactory>,
    media_source: Arc<dyn MediaSource>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    media: Mutex<MediaBundle>,
    facing: SyncMutex<FacingMode>,
    role: SyncMutex<Option<Role>>,
    next_session: AtomicU64,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    ui_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new(
        local_id: impl Into<String>,
        config: ClientConfig,
        signaling: SignalingSender,
        factory: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> (Arc<Self>, ManagerChannels) {
        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        let (ui_tx, ui_events) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            local_id: local_id.into(),
            config,
            signaling,
            factory,
            media_source,
            sessions: Mutex::new(HashMap::new()),
            media: Mutex::new(MediaBundle::default()),
            facing: SyncMutex::new(FacingMode::default()),
            role: SyncMutex::new(None),
            next_session: AtomicU64::new(1),
            peer_tx,
            ui_tx,
        });

        (
            manager,
            ManagerChannels {
                peer_events,
                ui_events,
            },
        )
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn role(&self) -> Option<Role> {
        *self.role.lock()
    }

    pub async fn session(&self, remote_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions
            .lock()
            .await
            .get(remote_id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Status feed of the current session with `remote_id`
    pub async fn subscribe_session(&self, remote_id: &str) -> Option<watch::Receiver<ConnectionStatus>> {
        self.session(remote_id)
            .await
            .map(|session| session.monitor().subscribe())
    }

    pub async fn remote_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn media(&self) -> MediaBundle {
        self.media.lock().await.clone()
    }

    fn emit(&self, event: ManagerEvent) {
        if self.ui_tx.send(event).is_err() {
            debug!("UI event dropped, no listener");
        }
    }

    async fn sessions_snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.session))
            .collect()
    }

    pub fn join(&self, room_id: &str, pin: &str) -> Result<()> {
        info!("Joining room {} as {}", room_id, self.local_id);
        self.signaling.send(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            pin: pin.to_string(),
            user_id: self.local_id.clone(),
        })
    }

    /// Acquire camera and microphone. Existing sessions pick them up through a
    /// repair, which swaps out earlier tracks or attaches and renegotiates.
    pub async fn start_local_media(self: &Arc<Self>) -> Result<()> {
        let facing = *self.facing.lock();
        let camera = self.media_source.open_camera(facing).await?;
        let microphone = self.media_source.open_microphone().await?;

        {
            let mut media = self.media.lock().await;
            if let Some(old) = media.camera.replace(camera) {
                old.stop();
            }
            if let Some(old) = media.microphone.replace(microphone) {
                old.stop();
            }
        }

        for session in self.sessions_snapshot().await {
            self.schedule_repair(session.remote_id().to_string(), false).await;
        }
        Ok(())
    }

    async fn create_session(&self, remote_id: &str, role: PeerRole) -> Result<Arc<PeerSession>> {
        let tracks = self.media.lock().await.user_tracks();

        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(remote_id) {
            return Ok(Arc::clone(&entry.session));
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let sink = PeerEventSink::new(remote_id, id, self.peer_tx.clone());
        let transport = self.factory.create(sink).await?;
        let session = Arc::new(PeerSession::new(remote_id, role, transport));
        session.add_local_stream(&tracks).await?;

        info!("Session {} with {} created ({:?})", id, remote_id, role);
        sessions.insert(
            remote_id.to_string(),
            SessionEntry {
                id,
                session: Arc::clone(&session),
            },
        );
        Ok(session)
    }

    /// Drop and close a session. Returns false if there was none.
    async fn remove_session(&self, remote_id: &str) -> bool {
        let entry = self.sessions.lock().await.remove(remote_id);
        let Some(entry) = entry else {
            return false;
        };
        if let Err(e) = entry.session.close().await {
            warn!("Closing session with {} failed: {}", remote_id, e);
        }
        true
    }

    fn send_offer(&self, remote_id: &str, offer: &SessionDescription) -> Result<()> {
        self.signaling.send(ClientMessage::offer(remote_id, offer)?)
    }

    /// Run the track check for one session, inline or after the settling delay
    async fn schedule_repair(self: &Arc<Self>, remote_id: String, force: bool) {
        let delay = self.config.repair_delay();
        if delay.is_zero() {
            self.repair_session(&remote_id, force).await;
            return;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.repair_session(&remote_id, force).await;
        });
    }

    async fn repair_session(&self, remote_id: &str, force: bool) {
        let Some(session) = self.session(remote_id).await else {
            return;
        };
        let tracks = self.media.lock().await.all_tracks();

        match session.repair(&tracks, force).await {
            Ok(Some(offer)) => {
                debug!("Repair of {} produced an offer", remote_id);
                if let Err(e) = self.send_offer(remote_id, &offer) {
                    warn!("Failed to send offer to {}: {}", remote_id, e);
                }
            }
            Ok(None) => {}
            Err(Error::SessionClosed(_)) => debug!("Repair skipped, session {} closed", remote_id),
            Err(e) => warn!("Repair of {} failed: {}", remote_id, e),
        }
    }

    pub async fn handle_server_message(self: &Arc<Self>, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::CurrentParticipants { participants, role } => {
                info!("Joined as {} with {} participant(s) present", role, participants.len());
                *self.role.lock() = Some(role);
                for remote_id in &participants {
                    self.create_session(remote_id, PeerRole::Polite).await?;
                }
                self.emit(ManagerEvent::Joined {
                    role,
                    participants: participants.clone(),
                });
                // The joiner opens negotiation with everyone already present
                for remote_id in participants {
                    self.schedule_repair(remote_id, true).await;
                }
            }
            ServerMessage::UserJoined { user_id } => {
                if self.remove_session(&user_id).await {
                    debug!("Replaced stale session with {}", user_id);
                }
                // Wait for the newcomer's offer; only offer if tracks changed
                self.create_session(&user_id, PeerRole::Impolite).await?;
                self.emit(ManagerEvent::ParticipantJoined(user_id.clone()));
                self.schedule_repair(user_id, false).await;
            }
            ServerMessage::UserLeft { user_id } => {
                self.remove_session(&user_id).await;
                self.emit(ManagerEvent::ParticipantLeft(user_id.clone()));
                self.emit(ManagerEvent::RemoteStreamsGone(user_id));
            }
            ServerMessage::Offer { offer, from } => {
                let offer: SessionDescription = decode_payload(offer)?;
                let session = self.create_session(&from, PeerRole::Polite).await?;
                match session.handle_offer(offer).await? {
                    OfferOutcome::Answered {
                        answer,
                        renegotiate,
                    } => {
                        self.signaling.send(ClientMessage::answer(&from, &answer)?)?;
                        if renegotiate {
                            self.schedule_repair(from, false).await;
                        }
                    }
                    OfferOutcome::Ignored => {}
                }
            }
            ServerMessage::Answer { answer, from } => {
                let Some(session) = self.session(&from).await else {
                    warn!("Answer from {} without a session", from);
                    return Ok(());
                };
                if let AnswerOutcome::Applied { renegotiate: true } =
                    session.handle_answer(decode_payload(answer)?).await?
                {
                    self.schedule_repair(from, false).await;
                }
            }
            ServerMessage::IceCandidate { candidate, from } => {
                let candidate: IceCandidate = decode_payload(candidate)?;
                let session = self.create_session(&from, PeerRole::Polite).await?;
                session.handle_ice_candidate(candidate).await?;
            }
            ServerMessage::MediaState {
                user_id,
                audio,
                video,
            } => {
                self.emit(ManagerEvent::RemoteMediaState {
                    remote_id: user_id,
                    audio,
                    video,
                });
            }
            ServerMessage::ScreenShareStarted { user_id, stream_id } => {
                if let (Some(stream_id), Some(session)) = (stream_id, self.session(&user_id).await) {
                    session.mark_remote_screen_stream(stream_id).await;
                }
                self.emit(ManagerEvent::RemoteScreenShare {
                    remote_id: user_id,
                    active: true,
                });
            }
            ServerMessage::ScreenShareStopped { user_id } => {
                if let Some(session) = self.session(&user_id).await {
                    session.clear_remote_screen_streams().await;
                }
                self.emit(ManagerEvent::RemoteScreenShare {
                    remote_id: user_id,
                    active: false,
                });
            }
            ServerMessage::HostChanged { user_id } => {
                if user_id == self.local_id {
                    info!("This participant is now host");
                    *self.role.lock() = Some(Role::Host);
                }
                self.emit(ManagerEvent::HostChanged(user_id));
            }
            ServerMessage::Error { code, message } => {
                warn!("Signaling error {}: {}", code, message);
                self.emit(ManagerEvent::SignalingError { code, message });
            }
        }
        Ok(())
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) -> Result<()> {
        let PeerEvent {
            remote_id,
            session: session_id,
            event,
        } = event;

        let session = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&remote_id) {
                Some(entry) if entry.id == session_id => Arc::clone(&entry.session),
                _ => {
                    debug!("Event for retired session {} of {} dropped", session_id, remote_id);
                    return Ok(());
                }
            }
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.signaling
                    .send(ClientMessage::ice_candidate(&remote_id, &candidate)?)?;
            }
            TransportEvent::RemoteTrack(info) => {
                let kind = session.classify_remote_track(&info).await;
                debug!("Remote {:?} track {} from {}", kind, info.track_id, remote_id);
                self.emit(ManagerEvent::RemoteTrack {
                    remote_id,
                    kind,
                    info,
                });
            }
            TransportEvent::StateChanged(state) => {
                if state == ConnectionState::Failed {
                    session.monitor().set_error(format!("connection to {} failed", remote_id));
                } else {
                    session.monitor().update_state(state);
                }
                self.emit(ManagerEvent::ConnectionState {
                    remote_id: remote_id.clone(),
                    state,
                });
                if state.is_terminal() {
                    info!("Session with {} {}, evicting", remote_id, state);
                    self.remove_session(&remote_id).await;
                    self.emit(ManagerEvent::RemoteStreamsGone(remote_id));
                }
            }
        }
        Ok(())
    }

    pub async fn start_screen_share(self: &Arc<Self>) -> Result<()> {
        if self.media.lock().await.is_screen_sharing() {
            return Ok(());
        }

        let tracks = self.media_source.open_screen().await?;
        let stream_id = tracks.first().map(|t| t.stream_id().to_string());
        self.media.lock().await.screen = tracks.clone();
        info!("Screen share started ({} track(s))", tracks.len());

        // The marker goes out before any renegotiation offer
        self.signaling
            .send(ClientMessage::ScreenShareStarted { stream_id })?;

        for session in self.sessions_snapshot().await {
            let remote_id = session.remote_id().to_string();
            match session.add_screen_stream(&tracks).await {
                Ok(offer) => self.send_offer(&remote_id, &offer)?,
                Err(Error::OfferAlreadyPending { state }) => {
                    debug!("Screen offer to {} owed until stable ({})", remote_id, state);
                }
                Err(e) => warn!("Failed to share screen with {}: {}", remote_id, e),
            }
        }
        Ok(())
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        let tracks = std::mem::take(&mut self.media.lock().await.screen);
        if tracks.is_empty() {
            return Ok(());
        }

        for session in self.sessions_snapshot().await {
            if let Err(e) = session.remove_screen_stream().await {
                warn!("Failed to detach screen from {}: {}", session.remote_id(), e);
            }
        }
        for track in &tracks {
            track.stop();
        }

        info!("Screen share stopped");
        self.signaling.send(ClientMessage::ScreenShareStopped)
    }

    async fn broadcast_media_state(&self) -> Result<()> {
        let (audio, video) = {
            let media = self.media.lock().await;
            (media.audio_enabled(), media.video_enabled())
        };
        self.signaling.send(ClientMessage::MediaState { audio, video })
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        if let Some(mic) = self.media.lock().await.microphone.as_ref() {
            mic.set_enabled(enabled);
        }
        self.broadcast_media_state().await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        if let Some(camera) = self.media.lock().await.camera.as_ref() {
            camera.set_enabled(enabled);
        }
        self.broadcast_media_state().await
    }

    /// Flip between front and back camera without renegotiating
    pub async fn switch_camera(&self) -> Result<()> {
        let facing = self.facing.lock().flipped();
        let new_camera = self.media_source.open_camera(facing).await?;

        let old_camera = {
            let mut media = self.media.lock().await;
            let old = media.camera.replace(Arc::clone(&new_camera));
            if let Some(ref old) = old {
                new_camera.set_enabled(old.is_enabled());
            }
            old
        };
        *self.facing.lock() = facing;

        if let Some(old) = old_camera {
            for session in self.sessions_snapshot().await {
                if let Err(e) = session
                    .update_media_track(old.id(), Arc::clone(&new_camera))
                    .await
                {
                    warn!("Camera switch for {} failed: {}", session.remote_id(), e);
                }
            }
            old.stop();
        }

        info!("Camera switched to {:?}", facing);
        Ok(())
    }

    /// Leave the room, closing every session and stopping local media
    pub async fn leave(&self) -> Result<()> {
        let sent = self.signaling.send(ClientMessage::LeaveRoom);
        self.close_all().await;
        sent
    }

    async fn close_all(&self) {
        let entries: Vec<(String, SessionEntry)> = self.sessions.lock().await.drain().collect();
        for (remote_id, entry) in entries {
            if let Err(e) = entry.session.close().await {
                warn!("Closing session with {} failed: {}", remote_id, e);
            }
            self.emit(ManagerEvent::RemoteStreamsGone(remote_id));
        }

        let media = std::mem::take(&mut *self.media.lock().await);
        media.stop_all();
        *self.role.lock() = None;
    }

    /// Process signaling messages and transport events until signaling closes
    pub async fn run(
        self: Arc<Self>,
        mut signaling_rx: mpsc::UnboundedReceiver<ServerMessage>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                msg = signaling_rx.recv() => {
                    let Some(msg) = msg else {
                        info!("Signaling closed");
                        break;
                    };
                    if let Err(e) = self.handle_server_message(msg).await {
                        warn!("Signaling message failed: {}", e);
                    }
                }
                Some(event) = peer_events.recv() => {
                    if let Err(e) = self.handle_peer_event(event).await {
                        warn!("Peer event failed: {}", e);
                    }
                }
            }
        }
        self.close_all().await;
    }
}
