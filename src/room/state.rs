use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role granted by the PIN presented at join time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Participant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Participant => write!(f, "participant"),
        }
    }
}

/// Result of removing a member from a room
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    /// Whether the participant was a member before the call
    pub removed: bool,
    /// Participant promoted to host because the last host left
    pub new_host: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub host_pin: String,
    pub participant_pin: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    /// Members in join order
    members: Vec<(String, Role)>,
}

impl Room {
    pub fn new(id: String, host_pin: String, participant_pin: String) -> Self {
        Self {
            id,
            host_pin,
            participant_pin,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            members: Vec::new(),
        }
    }

    pub fn role_for_pin(&self, pin: &str) -> Option<Role> {
        if pin == self.host_pin {
            Some(Role::Host)
        } else if pin == self.participant_pin {
            Some(Role::Participant)
        } else {
            None
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Returns false if the participant was already a member.
    pub fn add_participant(&mut self, participant_id: &str, role: Role) -> bool {
        if self.contains(participant_id) {
            return false;
        }
        self.members.push((participant_id.to_string(), role));
        self.touch();
        true
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Removal {
        let Some(pos) = self.members.iter().position(|(id, _)| id == participant_id) else {
            return Removal::default();
        };

        let (_, role) = self.members.remove(pos);
        self.touch();

        let mut removal = Removal {
            removed: true,
            new_host: None,
        };

        // Longest-present member inherits the host role
        if role == Role::Host && self.host().is_none() {
            if let Some((id, role)) = self.members.first_mut() {
                *role = Role::Host;
                removal.new_host = Some(id.clone());
            }
        }

        removal
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.members.iter().any(|(id, _)| id == participant_id)
    }

    pub fn role_of(&self, participant_id: &str) -> Option<Role> {
        self.members
            .iter()
            .find(|(id, _)| id == participant_id)
            .map(|(_, role)| *role)
    }

    pub fn host(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, role)| *role == Role::Host)
            .map(|(id, _)| id.as_str())
    }

    pub fn participants(&self) -> Vec<String> {
        self.members.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.is_empty() && now.saturating_duration_since(self.last_activity) > ttl
    }
}
