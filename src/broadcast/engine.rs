//! The broadcast loop: single producer, per-listener fan-out
//!
//! One long-running thread owns the capture device, the Opus encoder, and
//! the listener registry. Signaling hands new listeners over a channel; the
//! loop is the only code that ever touches the registry map.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Receiver, TryRecvError};

use crate::audio::CaptureSource;
use crate::broadcast::peer::{EncodedFrame, Peer, PeerState};
use crate::codec::OpusEncoder;
use crate::constants::{FRAME_DURATION, FRAME_SAMPLES, MAX_PACKET_BYTES, STATS_INTERVAL};
use crate::error::Error;

/// The single-producer broadcast engine.
///
/// Owns the capture source, the encoder, and the listener registry. Capture
/// runs only while the registry is non-empty; each tick reads one frame,
/// encodes it, and offers it to every connected listener without ever
/// blocking on a slow one.
pub struct Broadcaster {
    capture: Box<dyn CaptureSource>,
    encoder: OpusEncoder,

    /// Listener registry, keyed by registration id. Only this loop mutates it.
    peers: HashMap<u64, Peer>,

    /// Hand-off channel from the signaling layer
    new_peers: Receiver<Peer>,

    /// Closed by the shutdown watcher
    shutdown: Receiver<()>,

    /// Next listener id; strictly increasing, never reused
    next_id: u64,

    capturing: bool,
    last_stats: Instant,
}

impl Broadcaster {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        encoder: OpusEncoder,
        new_peers: Receiver<Peer>,
        shutdown: Receiver<()>,
    ) -> Self {
        Self {
            capture,
            encoder,
            peers: HashMap::new(),
            new_peers,
            shutdown,
            next_id: 0,
            capturing: false,
            last_stats: Instant::now(),
        }
    }

    /// Run the broadcast loop until shutdown or a fatal pipeline error.
    ///
    /// Capture and encode failures are fatal; final per-listener stats are
    /// logged before the error is returned so they are never lost.
    pub fn run(mut self) -> crate::Result<()> {
        let result = self.run_loop();

        self.log_stats("final listener stats");
        self.suspend_capture();

        if let Err(e) = &result {
            tracing::error!("broadcast engine failed: {}", e);
        }
        result
    }

    fn run_loop(&mut self) -> crate::Result<()> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let mut packet = vec![0u8; MAX_PACKET_BYTES];

        loop {
            match self.shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => {
                    tracing::info!("broadcast engine shutting down");
                    return Ok(());
                }
            }

            if self.peers.is_empty() {
                self.suspend_capture();
                tracing::info!("waiting for listeners");

                let arrival = crossbeam_channel::select! {
                    recv(self.new_peers) -> msg => msg.ok(),
                    recv(self.shutdown) -> _ => None,
                };
                match arrival {
                    Some(peer) => {
                        self.register(peer);
                        continue;
                    }
                    None => {
                        tracing::info!("broadcast engine shutting down");
                        return Ok(());
                    }
                }
            }

            // Pick up any listeners that connected since the last tick
            while let Ok(peer) = self.new_peers.try_recv() {
                self.register(peer);
            }

            if !self.capturing {
                self.capture.start().map_err(Error::from)?;
                self.capturing = true;
                tracing::info!("capture started");
            }

            self.capture.read(&mut pcm).map_err(Error::from)?;
            let size = self.encoder.encode(&pcm, &mut packet).map_err(Error::from)?;

            let frame = EncodedFrame {
                data: Bytes::copy_from_slice(&packet[..size]),
                duration: FRAME_DURATION,
            };
            self.fan_out(&frame);

            if self.last_stats.elapsed() >= STATS_INTERVAL {
                self.log_stats("listener stats");
                self.last_stats = Instant::now();
            }
        }
    }

    /// Register a freshly connected listener under the next id
    fn register(&mut self, peer: Peer) {
        let id = self.next_id;
        self.next_id += 1;

        tracing::info!("listener {} registered", id);
        self.peers.insert(id, peer);
    }

    /// Offer one encoded frame to every listener.
    ///
    /// Closed listeners are removed here (their queue closes when the last
    /// `Peer` handle drops, which terminates the sender task). Disconnected
    /// listeners are skipped but kept: browsers transiently lose ICE and
    /// come back. The enqueue is non-blocking; a full queue counts as a drop.
    fn fan_out(&mut self, frame: &EncodedFrame) {
        self.peers.retain(|id, peer| match peer.shared.state() {
            PeerState::Closed => {
                tracing::info!(
                    "listener {} closed: {} sent, {} dropped",
                    id,
                    peer.shared.sent.load(Ordering::Relaxed),
                    peer.shared.dropped.load(Ordering::Relaxed),
                );
                false
            }
            PeerState::Disconnected => true,
            PeerState::Connected => {
                match peer.frames.try_send(frame.clone()) {
                    Ok(()) => {
                        peer.shared.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        peer.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                true
            }
        });
    }

    fn suspend_capture(&mut self) {
        if self.capturing {
            self.capture.abort();
            self.capturing = false;
            tracing::info!("capture suspended");
        }
    }

    fn log_stats(&self, label: &str) {
        for (id, peer) in &self.peers {
            tracing::info!(
                "{}: listener {} ({:?}): {} sent, {} dropped",
                label,
                id,
                peer.shared.state(),
                peer.shared.sent.load(Ordering::Relaxed),
                peer.shared.dropped.load(Ordering::Relaxed),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::peer::PeerShared;
    use crate::constants::QUEUE_CAPACITY;
    use crate::error::AudioError;
    use crate::testing::{SilenceSource, SineSource};
    use crossbeam_channel::{bounded, unbounded, Sender};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        handoff: Sender<Peer>,
        shutdown: Sender<()>,
        engine: thread::JoinHandle<crate::Result<()>>,
    }

    fn start_engine(capture: Box<dyn CaptureSource>) -> Fixture {
        let (handoff, new_peers) = unbounded();
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let encoder = OpusEncoder::new().expect("encoder");
        let broadcaster = Broadcaster::new(capture, encoder, new_peers, shutdown_rx);
        let engine = thread::spawn(move || broadcaster.run());
        Fixture {
            handoff,
            shutdown,
            engine,
        }
    }

    fn connected_peer() -> (Peer, mpsc::Receiver<EncodedFrame>, Arc<PeerShared>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shared = Arc::new(PeerShared::new());
        shared.set_state(PeerState::Connected);
        let peer = Peer {
            shared: Arc::clone(&shared),
            frames: tx,
        };
        (peer, rx, shared)
    }

    /// Drain frames until the queue closes, panicking if it stays open.
    fn expect_queue_closes(mut rx: mpsc::Receiver<EncodedFrame>) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match rx.try_recv() {
                Ok(_) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => return,
                Err(mpsc::error::TryRecvError::Empty) => {
                    assert!(Instant::now() < deadline, "frame queue never closed");
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    struct FailingSource;

    impl CaptureSource for FailingSource {
        fn start(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
        fn abort(&mut self) {}
        fn read(&mut self, _buf: &mut [i16]) -> Result<(), AudioError> {
            Err(AudioError::StreamError("simulated device fault".to_string()))
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_idle_until_first_listener_then_suspend_on_close() {
        let source = SineSource::new(440.0);
        let probe = source.probe();
        let fixture = start_engine(Box::new(source));

        // No listeners: the device must stay idle
        thread::sleep(Duration::from_millis(50));
        assert!(!probe.is_running());
        assert_eq!(probe.frames_read(), 0);

        let (peer, rx, shared) = connected_peer();
        fixture.handoff.send(peer).expect("handoff");

        wait_for(|| probe.is_running(), "capture to start");
        wait_for(|| probe.frames_read() > 0, "frames to flow");

        shared.set_state(PeerState::Closed);
        wait_for(|| !probe.is_running(), "capture to suspend");
        expect_queue_closes(rx);

        drop(fixture.shutdown);
        assert!(fixture.engine.join().expect("join").is_ok());
    }

    #[test]
    fn test_all_listeners_receive_every_frame() {
        let source = SineSource::new(440.0);
        let probe = source.probe();
        let fixture = start_engine(Box::new(source));

        let (peer_a, mut rx_a, shared_a) = connected_peer();
        let (peer_b, mut rx_b, shared_b) = connected_peer();
        fixture.handoff.send(peer_a).expect("handoff");
        fixture.handoff.send(peer_b).expect("handoff");

        // Drain both queues so neither ever overflows
        let drain_a = thread::spawn(move || while rx_a.blocking_recv().is_some() {});
        let drain_b = thread::spawn(move || while rx_b.blocking_recv().is_some() {});

        thread::sleep(Duration::from_millis(300));
        drop(fixture.shutdown);
        assert!(fixture.engine.join().expect("join").is_ok());
        drain_a.join().expect("drain a");
        drain_b.join().expect("drain b");

        let produced = probe.frames_read();
        let sent_a = shared_a.sent.load(Ordering::Relaxed);
        let sent_b = shared_b.sent.load(Ordering::Relaxed);

        assert!(produced > 0);
        // Every produced frame reached both queues (modulo the in-flight tick)
        assert!(produced.abs_diff(sent_a) <= 2, "a: {} vs {}", produced, sent_a);
        assert!(produced.abs_diff(sent_b) <= 2, "b: {} vs {}", produced, sent_b);
        assert_eq!(shared_a.dropped.load(Ordering::Relaxed), 0);
        assert_eq!(shared_b.dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_slow_listener_only_degrades_itself() {
        let fixture = start_engine(Box::new(SilenceSource::new()));

        // Listener C never drains its queue; listener D drains continuously
        let (peer_c, rx_c, shared_c) = connected_peer();
        let (peer_d, mut rx_d, shared_d) = connected_peer();
        fixture.handoff.send(peer_c).expect("handoff");
        fixture.handoff.send(peer_d).expect("handoff");

        let drain_d = thread::spawn(move || while rx_d.blocking_recv().is_some() {});

        wait_for(
            || shared_c.dropped.load(Ordering::Relaxed) >= 5,
            "slow listener to accrue drops",
        );

        let sent_c = shared_c.sent.load(Ordering::Relaxed);
        let sent_d = shared_d.sent.load(Ordering::Relaxed);
        assert_eq!(sent_c, QUEUE_CAPACITY as u64);
        assert!(sent_d > sent_c);
        assert_eq!(shared_d.dropped.load(Ordering::Relaxed), 0);

        drop(fixture.shutdown);
        assert!(fixture.engine.join().expect("join").is_ok());
        drop(rx_c);
        drain_d.join().expect("drain d");
    }

    #[test]
    fn test_disconnected_listener_is_skipped_not_removed() {
        let fixture = start_engine(Box::new(SilenceSource::new()));

        let (peer, mut rx, shared) = connected_peer();
        fixture.handoff.send(peer).expect("handoff");

        wait_for(|| shared.sent.load(Ordering::Relaxed) > 0, "delivery to start");

        shared.set_state(PeerState::Disconnected);
        thread::sleep(Duration::from_millis(50));
        while rx.try_recv().is_ok() {}
        let sent_while_gone = shared.sent.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        // No frames queued and none dropped while disconnected
        assert_eq!(shared.sent.load(Ordering::Relaxed), sent_while_gone);
        assert_eq!(shared.dropped.load(Ordering::Relaxed), 0);

        // The listener comes back and delivery resumes
        shared.set_state(PeerState::Connected);
        wait_for(
            || shared.sent.load(Ordering::Relaxed) > sent_while_gone,
            "delivery to resume",
        );

        drop(fixture.shutdown);
        assert!(fixture.engine.join().expect("join").is_ok());
    }

    #[test]
    fn test_capture_fault_is_fatal() {
        let fixture = start_engine(Box::new(FailingSource));

        let (peer, _rx, _shared) = connected_peer();
        fixture.handoff.send(peer).expect("handoff");

        let result = fixture.engine.join().expect("join");
        assert!(matches!(result, Err(Error::Audio(_))));
    }

    #[test]
    fn test_shutdown_while_idle() {
        let source = SineSource::new(440.0);
        let probe = source.probe();
        let fixture = start_engine(Box::new(source));

        drop(fixture.shutdown);
        assert!(fixture.engine.join().expect("join").is_ok());
        assert!(!probe.is_running());
    }
}
