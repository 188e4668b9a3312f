mod classify;
mod description;
#[cfg(test)]
pub(crate) mod fake;
mod session;
mod transport;

pub use classify::{classify_remote_track, ClassifyContext, RemoteTrackKind};
pub use description::{IceCandidate, SdpKind, SessionDescription};
pub use session::{
    AnswerOutcome, CandidateOutcome, NegotiationState, OfferOutcome, PeerRole, PeerSession,
};
pub use transport::{
    PeerEvent, PeerEventSink, PeerTransport, RemoteTrackInfo, TransceiverDirection,
    TransportEvent, TransportFactory, WebRtcTransport, WebRtcTransportFactory,
};
