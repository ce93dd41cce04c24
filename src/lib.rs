//! # Streama
//!
//! Single-source, many-listener live audio broadcaster. One process captures
//! PCM audio from a local input device, encodes it to Opus, and fans the
//! encoded stream out over WebRTC to browser listeners that connect over HTTP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          BROADCAST THREAD                            │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────────────────┐   │
//! │  │ Microphone │──▶│ Opus Encoder │──▶│ Fan-out (one bounded     │   │
//! │  │ (capture)  │   │ (10ms frames)│   │ queue per listener,      │   │
//! │  └────────────┘   └──────────────┘   │ drop-newest on overflow) │   │
//! │                                      └─────┬──────────┬─────────┘   │
//! └────────────────────────────────────────────┼──────────┼─────────────┘
//!                                              │          │
//!                                        ┌─────▼───┐ ┌────▼────┐
//!                                        │ Sender  │ │ Sender  │  (tokio)
//!                                        │ task A  │ │ task B  │
//!                                        └─────┬───┘ └────┬────┘
//!                                              │ RTP      │ RTP
//!                                        ┌─────▼───┐ ┌────▼────┐
//!                                        │ Browser │ │ Browser │
//!                                        └─────────┘ └─────────┘
//!
//! Listeners join via POST /sdp: the response streams the SDP answer
//! followed by trickled ICE candidates as concatenated JSON objects.
//! ```
//!
//! The capture device is suspended while nobody is listening and resumed on
//! the first connection. A slow listener only degrades itself: frames that
//! do not fit its queue are dropped and counted, never blocking capture.

pub mod audio;
pub mod broadcast;
pub mod codec;
pub mod error;
pub mod metrics;
pub mod signaling;
pub mod testing;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Sample rate for capture and encoding
    pub const SAMPLE_RATE: u32 = 48_000;

    /// Channel count (stereo)
    pub const CHANNELS: u16 = 2;

    /// Duration of one audio frame
    pub const FRAME_DURATION: Duration = Duration::from_millis(10);

    /// PCM samples per channel in one frame (10ms at 48kHz)
    pub const SAMPLES_PER_CHANNEL: usize = SAMPLE_RATE as usize / 100;

    /// Interleaved PCM samples in one frame (all channels)
    pub const FRAME_SAMPLES: usize = SAMPLES_PER_CHANNEL * CHANNELS as usize;

    /// Upper bound on one encoded Opus packet at these settings
    pub const MAX_PACKET_BYTES: usize = 1024;

    /// Per-listener frame queue capacity (about 100ms of audio)
    pub const QUEUE_CAPACITY: usize = 10;

    /// Interval between per-listener stats log lines
    pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

    /// STUN server used for ICE candidate discovery
    pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

    /// HTTP listen address
    pub const LISTEN_ADDR: &str = "0.0.0.0:8080";

    /// Grace period for in-flight requests during shutdown
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
}
