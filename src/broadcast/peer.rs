//! Per-listener state shared between the WebRTC callbacks, the per-listener
//! sender task, and the broadcast loop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

/// One encoded Opus packet plus its playback duration.
///
/// `Bytes` makes the per-listener clone cheap; the payload is copied out of
/// the encoder's scratch buffer once per tick.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Liveness state of a listener's peer connection.
///
/// Transitions are monotone in the partial order
/// `Disconnected ↔ Connected → Closed`; `Closed` is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected = 0,
    Connected = 1,
    Closed = 2,
}

impl PeerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PeerState::Connected,
            2 => PeerState::Closed,
            _ => PeerState::Disconnected,
        }
    }
}

/// State shared across threads for one listener.
///
/// The WebRTC state callback writes `state`; the broadcast loop reads it and
/// owns the delivery counters. A single machine-word atomic is enough, no
/// mutex involved.
pub struct PeerShared {
    state: AtomicU8,

    /// Whether this listener is currently counted in the live-clients gauge
    counted: AtomicBool,

    /// Frames successfully queued for delivery
    pub sent: AtomicU64,

    /// Frames dropped because the listener's queue was full
    pub dropped: AtomicU64,
}

impl PeerShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PeerState::Disconnected as u8),
            counted: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply a state transition. `Closed` is terminal: once stored it is
    /// never overwritten, so a late Disconnected callback cannot resurrect a
    /// torn-down listener.
    pub fn set_state(&self, next: PeerState) {
        if next == PeerState::Closed {
            self.state.store(PeerState::Closed as u8, Ordering::Release);
            return;
        }

        let mut current = self.state.load(Ordering::Acquire);
        while current != PeerState::Closed as u8 {
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Mark this listener as counted in the live-clients gauge.
    /// Returns true if it was not counted before.
    pub fn mark_counted(&self) -> bool {
        !self.counted.swap(true, Ordering::AcqRel)
    }

    /// Remove this listener from the live-clients gauge.
    /// Returns true if it was counted before.
    pub fn clear_counted(&self) -> bool {
        self.counted.swap(false, Ordering::AcqRel)
    }
}

impl Default for PeerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// A listener as the broadcast loop sees it: shared state plus the producer
/// end of its bounded frame queue.
///
/// Dropping the last `Peer` clone closes the queue, which terminates the
/// listener's sender task.
#[derive(Clone)]
pub struct Peer {
    pub shared: Arc<PeerShared>,
    pub frames: mpsc::Sender<EncodedFrame>,
}
