//! Broadcast engine: single producer, per-listener fan-out

pub mod engine;
pub mod peer;

pub use engine::Broadcaster;
pub use peer::{EncodedFrame, Peer, PeerShared, PeerState};
