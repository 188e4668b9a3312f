//! Signaling wire messages
//!
//! Negotiation payloads (`offer`, `answer`, `candidate`) travel as opaque JSON
//! values: the server routes them without looking inside.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::peer::{IceCandidate, SessionDescription};
use crate::room::Role;

/// Participant to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        pin: String,
        user_id: String,
    },
    Offer {
        offer: Value,
        to: String,
    },
    Answer {
        answer: Value,
        to: String,
    },
    IceCandidate {
        candidate: Value,
        to: String,
    },
    MediaState {
        audio: bool,
        video: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStarted {
        /// Stream id of the outbound screen tracks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
    },
    ScreenShareStopped,
    LeaveRoom,
}

impl ClientMessage {
    pub fn offer(to: impl Into<String>, offer: &SessionDescription) -> Result<Self> {
        Ok(ClientMessage::Offer {
            offer: serde_json::to_value(offer)?,
            to: to.into(),
        })
    }

    pub fn answer(to: impl Into<String>, answer: &SessionDescription) -> Result<Self> {
        Ok(ClientMessage::Answer {
            answer: serde_json::to_value(answer)?,
            to: to.into(),
        })
    }

    pub fn ice_candidate(to: impl Into<String>, candidate: &IceCandidate) -> Result<Self> {
        Ok(ClientMessage::IceCandidate {
            candidate: serde_json::to_value(candidate)?,
            to: to.into(),
        })
    }
}

/// Server to participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Reply to a successful join: everyone already in the room
    CurrentParticipants {
        participants: Vec<String>,
        role: Role,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },
    Offer { offer: Value, from: String },
    Answer { answer: Value, from: String },
    IceCandidate { candidate: Value, from: String },
    #[serde(rename_all = "camelCase")]
    MediaState {
        user_id: String,
        audio: bool,
        video: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStarted {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStopped { user_id: String },
    #[serde(rename_all = "camelCase")]
    HostChanged { user_id: String },
    Error { code: u16, message: String },
}

impl ServerMessage {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// Decode a relayed negotiation payload
pub fn decode_payload<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SdpKind;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_format() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "join-room",
            "roomId": "abcd1234",
            "pin": "222222",
            "userId": "bob"
        }))
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: "abcd1234".into(),
                pin: "222222".into(),
                user_id: "bob".into(),
            }
        );
    }

    #[test]
    fn test_unit_variants() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"leave-room"}"#).unwrap();
        assert_eq!(msg, ClientMessage::LeaveRoom);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"screen-share-started"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ScreenShareStarted { stream_id: None });
    }

    #[test]
    fn test_server_messages_use_camel_case() {
        let msg = ServerMessage::UserJoined {
            user_id: "bob".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "user-joined", "userId": "bob"})
        );

        let msg = ServerMessage::CurrentParticipants {
            participants: vec!["alice".into()],
            role: Role::Participant,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "current-participants", "participants": ["alice"], "role": "participant"})
        );
    }

    #[test]
    fn test_offer_payload_survives_relay() {
        let desc = SessionDescription::offer("v=0\r\n");
        let msg = ClientMessage::offer("bob", &desc).unwrap();
        let ClientMessage::Offer { offer, to } = msg else {
            panic!("expected offer");
        };
        assert_eq!(to, "bob");
        assert_eq!(offer, json!({"type": "offer", "sdp": "v=0\r\n"}));

        let decoded: SessionDescription = decode_payload(offer).unwrap();
        assert_eq!(decoded.kind, SdpKind::Offer);
    }

    #[test]
    fn test_browser_candidate_payload() {
        let candidate: IceCandidate = decode_payload(json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }
}
