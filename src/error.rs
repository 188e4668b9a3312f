use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::peer::NegotiationState;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown room or wrong PIN. Deliberately a single variant.
    #[error("Access denied")]
    AccessDenied,

    #[error("Could not allocate a free room id after {attempts} attempts")]
    RoomIdExhausted { attempts: usize },

    #[error("Room already exists: {0}")]
    RoomExists(String),

    #[error("Connection has not joined a room")]
    NotInRoom,

    #[error("Participant not in room: {0}")]
    UnknownParticipant(String),

    #[error("Participant id already in use: {0}")]
    DuplicateParticipant(String),

    #[error("Cannot create offer while in {state} state")]
    OfferAlreadyPending { state: NegotiationState },

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::AccessDenied => StatusCode::FORBIDDEN,
            Error::RoomExists(_) | Error::DuplicateParticipant(_) => StatusCode::CONFLICT,
            Error::RoomIdExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnknownParticipant(_) => StatusCode::NOT_FOUND,
            Error::NotInRoom | Error::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error_message = %body.message, "Request failed");
        } else {
            tracing::debug!(error_message = %body.message, "Request rejected");
        }

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
