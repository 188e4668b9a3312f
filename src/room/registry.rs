//! In-memory room store with PIN-based access and TTL expiry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::{Removal, Role, Room};
use crate::config::ServerConfig;
use crate::error::{Error, Result};

const ROOM_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Credentials handed out when a room is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCredentials {
    pub room_id: String,
    pub host_pin: String,
    pub participant_pin: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl AccessCheck {
    fn denied() -> Self {
        Self {
            valid: false,
            role: None,
        }
    }
}

/// Room ids are case-insensitive; they are stored upper-case.
pub fn normalize_room_id(room_id: &str) -> String {
    room_id.trim().to_ascii_uppercase()
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
    room_id_length: usize,
    pin_length: usize,
    max_attempts: usize,
    ttl: Duration,
}

impl RoomRegistry {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            room_id_length: config.room_id_length.max(1),
            pin_length: config.pin_length.max(1),
            max_attempts: config.max_room_id_attempts.max(1),
            ttl: config.room_ttl(),
        }
    }

    /// Create a room with a fresh code and a distinct PIN per role
    pub fn create_room(&self) -> Result<RoomCredentials> {
        let mut rng = rand::thread_rng();
        let mut rooms = self.rooms.lock();

        let room_id = (0..self.max_attempts)
            .map(|_| random_code(&mut rng, ROOM_ID_CHARSET, self.room_id_length))
            .find(|candidate| !rooms.contains_key(candidate))
            .ok_or(Error::RoomIdExhausted {
                attempts: self.max_attempts,
            })?;

        let host_pin = random_code(&mut rng, b"0123456789", self.pin_length);
        let participant_pin = loop {
            let pin = random_code(&mut rng, b"0123456789", self.pin_length);
            if pin != host_pin {
                break pin;
            }
        };

        let room = Room::new(room_id.clone(), host_pin, participant_pin);
        let credentials = credentials_of(&room);
        rooms.insert(room_id.clone(), room);

        info!("Room {} created ({} live)", room_id, rooms.len());
        Ok(credentials)
    }

    /// Register a room with caller-chosen credentials
    pub fn insert_room(
        &self,
        room_id: &str,
        host_pin: &str,
        participant_pin: &str,
    ) -> Result<RoomCredentials> {
        let room_id = normalize_room_id(room_id);
        if room_id.is_empty() || host_pin.is_empty() || participant_pin.is_empty() {
            return Err(Error::Config(
                "room id and both PINs must be non-empty".to_string(),
            ));
        }
        if host_pin == participant_pin {
            return Err(Error::Config("host and participant PINs must differ".to_string()));
        }

        let mut rooms = self.rooms.lock();
        if rooms.contains_key(&room_id) {
            return Err(Error::RoomExists(room_id));
        }

        let room = Room::new(
            room_id.clone(),
            host_pin.to_string(),
            participant_pin.to_string(),
        );
        let credentials = credentials_of(&room);
        rooms.insert(room_id.clone(), room);

        info!("Room {} registered", room_id);
        Ok(credentials)
    }

    /// Check a PIN against a room. Unknown room and wrong PIN look the same.
    pub fn validate_access(&self, room_id: &str, pin: &str) -> AccessCheck {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(&normalize_room_id(room_id)) else {
            return AccessCheck::denied();
        };

        match room.role_for_pin(pin) {
            Some(role) => {
                room.touch();
                AccessCheck {
                    valid: true,
                    role: Some(role),
                }
            }
            None => AccessCheck::denied(),
        }
    }

    /// Add a member. Adding an existing member is a no-op.
    pub fn add_participant(&self, room_id: &str, participant_id: &str, role: Role) -> Result<()> {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .get_mut(&normalize_room_id(room_id))
            .ok_or(Error::AccessDenied)?;

        if room.add_participant(participant_id, role) {
            debug!("{} joined room {} as {}", participant_id, room.id, role);
        }
        Ok(())
    }

    /// Remove a member. Removing a non-member (or from an unknown room) is a no-op.
    pub fn remove_participant(&self, room_id: &str, participant_id: &str) -> Removal {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(&normalize_room_id(room_id)) else {
            return Removal::default();
        };

        let removal = room.remove_participant(participant_id);
        if removal.removed {
            debug!("{} left room {}", participant_id, room.id);
        }
        if let Some(ref host) = removal.new_host {
            info!("Host of room {} passed to {}", room.id, host);
        }
        removal
    }

    pub fn participants(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .get(&normalize_room_id(room_id))
            .map(Room::participants)
            .unwrap_or_default()
    }

    pub fn role_of(&self, room_id: &str, participant_id: &str) -> Option<Role> {
        self.rooms
            .lock()
            .get(&normalize_room_id(room_id))
            .and_then(|room| room.role_of(participant_id))
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.lock().contains_key(&normalize_room_id(room_id))
    }

    pub fn delete_room(&self, room_id: &str) -> bool {
        let removed = self
            .rooms
            .lock()
            .remove(&normalize_room_id(room_id))
            .is_some();
        if removed {
            info!("Room {} deleted", normalize_room_id(room_id));
        }
        removed
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Delete empty rooms idle for longer than the TTL. Returns the deleted ids.
    pub fn purge_expired(&self, now: Instant) -> Vec<String> {
        let mut rooms = self.rooms.lock();
        let expired: Vec<String> = rooms
            .values()
            .filter(|room| room.is_expired(now, self.ttl))
            .map(|room| room.id.clone())
            .collect();

        for id in &expired {
            rooms.remove(id);
        }

        if !expired.is_empty() {
            info!("Expired {} room(s): {:?}", expired.len(), expired);
        }
        expired
    }

    /// Run `purge_expired` every `interval` until the handle is shut down
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let registry = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.purge_expired(Instant::now());
                    }
                }
            }
            debug!("Room sweeper stopped");
        });

        SweeperHandle { cancel, task }
    }
}

/// Owner of the background expiry task
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

fn credentials_of(room: &Room) -> RoomCredentials {
    RoomCredentials {
        room_id: room.id.clone(),
        host_pin: room.host_pin.clone(),
        participant_pin: room.participant_pin.clone(),
        created_at: room.created_at,
    }
}

fn random_code<R: Rng>(rng: &mut R, charset: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}
