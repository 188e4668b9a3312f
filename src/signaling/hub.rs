//! Room-scoped message relay shared by every signaling connection
//!
//! Each websocket (or in-process test client) attaches to the hub and gets a
//! queue of outbound [`ServerMessage`]s. Join, leave and relay run as one
//! step under the hub lock, so membership and routing never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::message::{ClientMessage, ServerMessage};
use crate::error::{Error, Result};
use crate::room::{normalize_room_id, Role, RoomRegistry};

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
struct Membership {
    room_id: String,
    user_id: String,
}

struct Connection {
    tx: mpsc::UnboundedSender<ServerMessage>,
    membership: Option<Membership>,
}

#[derive(Default)]
struct HubState {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
    /// room id -> user id -> connection
    rooms: HashMap<String, HashMap<String, ConnectionId>>,
}

impl HubState {
    fn send(&self, conn: ConnectionId, msg: ServerMessage) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        if connection.tx.send(msg).is_err() {
            debug!("Connection {} gone, message dropped", conn);
        }
    }

    /// Send to every member of `room_id` except `except`
    fn broadcast(&self, room_id: &str, except: Option<&str>, msg: &ServerMessage) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        for (user_id, conn) in members {
            if Some(user_id.as_str()) != except {
                self.send(*conn, msg.clone());
            }
        }
    }

    fn membership(&self, conn: ConnectionId) -> Result<Membership> {
        self.connections
            .get(&conn)
            .and_then(|c| c.membership.clone())
            .ok_or(Error::NotInRoom)
    }
}

/// Error code carried by `error` messages sent back to a client
pub fn signaling_error_code(err: &Error) -> u16 {
    match err {
        Error::AccessDenied => 401,
        Error::UnknownParticipant(_) => 404,
        Error::DuplicateParticipant(_) => 409,
        _ => 400,
    }
}

pub struct SignalingHub {
    registry: Arc<RoomRegistry>,
    state: Mutex<HubState>,
}

impl SignalingHub {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(HubState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Register a new connection and return its outbound queue
    pub async fn attach(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(
            id,
            Connection {
                tx,
                membership: None,
            },
        );
        debug!("Signaling connection {} attached", id);
        (id, rx)
    }

    /// Connection closed, cleanly or not
    pub async fn detach(&self, conn: ConnectionId) {
        let mut state = self.state.lock().await;
        self.leave_locked(&mut state, conn);
        state.connections.remove(&conn);
        debug!("Signaling connection {} detached", conn);
    }

    /// Parse and handle one text frame
    pub async fn handle_text(&self, conn: ConnectionId, text: &str) -> Result<()> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(conn, msg).await,
            Err(e) => {
                warn!("Malformed message on connection {}: {}", conn, e);
                let state = self.state.lock().await;
                state.send(conn, ServerMessage::error(400, format!("Malformed message: {}", e)));
                Err(e.into())
            }
        }
    }

    /// Handle one message. Failures are reported back to the sender as an
    /// `error` message and also returned.
    pub async fn handle(&self, conn: ConnectionId, msg: ClientMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let result = self.dispatch(&mut state, conn, msg);
        if let Err(ref e) = result {
            debug!("Connection {}: {}", conn, e);
            state.send(conn, ServerMessage::error(signaling_error_code(e), e.to_string()));
        }
        result
    }

    fn dispatch(&self, state: &mut HubState, conn: ConnectionId, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::JoinRoom {
                room_id,
                pin,
                user_id,
            } => self.join_locked(state, conn, &room_id, &pin, user_id),
            ClientMessage::Offer { offer, to } => {
                let me = state.membership(conn)?;
                self.relay_locked(state, &me, &to, ServerMessage::Offer {
                    offer,
                    from: me.user_id.clone(),
                })
            }
            ClientMessage::Answer { answer, to } => {
                let me = state.membership(conn)?;
                self.relay_locked(state, &me, &to, ServerMessage::Answer {
                    answer,
                    from: me.user_id.clone(),
                })
            }
            ClientMessage::IceCandidate { candidate, to } => {
                let me = state.membership(conn)?;
                self.relay_locked(state, &me, &to, ServerMessage::IceCandidate {
                    candidate,
                    from: me.user_id.clone(),
                })
            }
            ClientMessage::MediaState { audio, video } => {
                let me = state.membership(conn)?;
                let msg = ServerMessage::MediaState {
                    user_id: me.user_id.clone(),
                    audio,
                    video,
                };
                state.broadcast(&me.room_id, Some(&me.user_id), &msg);
                Ok(())
            }
            ClientMessage::ScreenShareStarted { stream_id } => {
                let me = state.membership(conn)?;
                let msg = ServerMessage::ScreenShareStarted {
                    user_id: me.user_id.clone(),
                    stream_id,
                };
                state.broadcast(&me.room_id, Some(&me.user_id), &msg);
                Ok(())
            }
            ClientMessage::ScreenShareStopped => {
                let me = state.membership(conn)?;
                let msg = ServerMessage::ScreenShareStopped {
                    user_id: me.user_id.clone(),
                };
                state.broadcast(&me.room_id, Some(&me.user_id), &msg);
                Ok(())
            }
            ClientMessage::LeaveRoom => {
                self.leave_locked(state, conn);
                Ok(())
            }
        }
    }

    fn join_locked(
        &self,
        state: &mut HubState,
        conn: ConnectionId,
        room_id: &str,
        pin: &str,
        user_id: String,
    ) -> Result<()> {
        let check = self.registry.validate_access(room_id, pin);
        let role = match (check.valid, check.role) {
            (true, Some(role)) => role,
            _ => {
                info!("Join of {} to {} rejected", user_id, room_id);
                return Err(Error::AccessDenied);
            }
        };
        let room_id = normalize_room_id(room_id);

        // Re-joining the same room under the same id from the same connection
        // is treated as a fresh join
        if let Ok(current) = state.membership(conn) {
            self.leave_locked(state, conn);
            debug!("{} left {} to join {}", current.user_id, current.room_id, room_id);
        }

        if state
            .rooms
            .get(&room_id)
            .is_some_and(|members| members.contains_key(&user_id))
        {
            return Err(Error::DuplicateParticipant(user_id));
        }

        let existing = self.registry.participants(&room_id);
        self.registry.add_participant(&room_id, &user_id, role)?;
        let role = self.registry.role_of(&room_id, &user_id).unwrap_or(role);

        state
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(user_id.clone(), conn);
        if let Some(connection) = state.connections.get_mut(&conn) {
            connection.membership = Some(Membership {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            });
        }

        info!("{} joined room {} as {} ({} already present)", user_id, room_id, role, existing.len());

        state.send(
            conn,
            ServerMessage::CurrentParticipants {
                participants: existing,
                role,
            },
        );
        state.broadcast(
            &room_id,
            Some(&user_id),
            &ServerMessage::UserJoined {
                user_id: user_id.clone(),
            },
        );
        Ok(())
    }

    fn relay_locked(&self, state: &HubState, from: &Membership, to: &str, msg: ServerMessage) -> Result<()> {
        let target = state
            .rooms
            .get(&from.room_id)
            .and_then(|members| members.get(to))
            .copied()
            .ok_or_else(|| {
                warn!(
                    "Relay from {} to {} dropped: target not in room {}",
                    from.user_id, to, from.room_id
                );
                Error::UnknownParticipant(to.to_string())
            })?;
        state.send(target, msg);
        Ok(())
    }

    fn leave_locked(&self, state: &mut HubState, conn: ConnectionId) {
        let Some(membership) = state
            .connections
            .get_mut(&conn)
            .and_then(|c| c.membership.take())
        else {
            return;
        };
        let Membership { room_id, user_id } = membership;

        if let Some(members) = state.rooms.get_mut(&room_id) {
            members.remove(&user_id);
            if members.is_empty() {
                state.rooms.remove(&room_id);
            }
        }

        let removal = self.registry.remove_participant(&room_id, &user_id);
        info!("{} left room {}", user_id, room_id);

        state.broadcast(&room_id, None, &ServerMessage::UserLeft { user_id });
        if let Some(new_host) = removal.new_host {
            state.broadcast(&room_id, None, &ServerMessage::HostChanged { user_id: new_host });
        }
    }

    /// Role currently held by a member, for diagnostics
    pub fn role_of(&self, room_id: &str, user_id: &str) -> Option<Role> {
        self.registry.role_of(room_id, user_id)
    }
}
