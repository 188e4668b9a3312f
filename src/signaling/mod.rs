//! Room-scoped signaling: wire messages, the server-side hub and HTTP
//! surface, and the participant-side WebSocket client

mod client;
mod hub;
mod message;
mod server;

pub use client::{SignalingClient, SignalingSender};
pub use hub::{signaling_error_code, ConnectionId, SignalingHub};
pub use message::{decode_payload, ClientMessage, ServerMessage};
pub use server::{router, serve, ServerState, ValidateRequest};
