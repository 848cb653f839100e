//! Signalling server client and message model

pub mod connection;
pub mod protocol;

pub use connection::{
    SessionEnd, SignallingObserver, SignallingServerConnection, SignallingTransport,
};
pub use protocol::{
    parse_message, IceCandidateInit, IceServer, IncomingMessage, OutgoingMessage, ParseOutcome,
    PeerConnectionOptions, PlayerId, PlayerIdFormat, WirePlayerId, CLOSE_CODE_PROTOCOL_ERROR,
};
