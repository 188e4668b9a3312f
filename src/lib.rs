//! Self-hosted signaling and peer negotiation for room-based video calls
//!
//! - [`room`]: rooms, PINs, membership and expiry
//! - [`signaling`]: wire messages, the relay hub with its HTTP/WebSocket
//!   server, and the participant-side client
//! - [`peer`]: per-remote negotiation state machine over a pluggable transport
//! - [`manager`]: the local participant's sessions and media

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

pub use error::{Error, Result};
