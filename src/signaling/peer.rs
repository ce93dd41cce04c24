//! WebRTC peer-connection plumbing
//!
//! Builds one peer connection per listener, wires its lifecycle to the
//! shared peer state, and spawns the two per-listener tasks: the sender that
//! drains the frame queue into the audio track, and the RTCP drain that
//! keeps the stack's interceptors (NACK) running.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::broadcast::{EncodedFrame, Peer, PeerShared, PeerState};
use crate::constants::{CHANNELS, QUEUE_CAPACITY, SAMPLE_RATE, STUN_SERVER};
use crate::error::SignalingError;
use crate::metrics::MetricsContext;
use crate::signaling::server::AppState;

/// Everything the signaling handler streams back to the client
pub struct Negotiation {
    /// The SDP answer; always the first object on the wire
    pub answer: RTCSessionDescription,

    /// Trickled ICE candidates; `None` marks gathering complete
    pub candidates: mpsc::Receiver<Option<RTCIceCandidate>>,
}

/// Build the shared WebRTC API: default codecs plus the default interceptor
/// chain. The interceptors only do their work if RTCP is drained per peer.
pub fn build_api() -> Result<API, SignalingError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_config() -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Negotiate one listener: peer connection, audio track, lifecycle wiring,
/// sender and RTCP tasks, then the offer/answer exchange.
///
/// On success the caller owns the answer and the candidate stream; the peer
/// itself reaches the broadcast loop through the hand-off channel once its
/// connection state first reaches Connected.
pub async fn accept_offer(
    state: &AppState,
    offer: RTCSessionDescription,
) -> Result<Negotiation, SignalingError> {
    let pc = Arc::new(state.api.new_peer_connection(rtc_config()).await?);
    tracing::debug!("peer connection created");

    let (ice_tx, ice_rx) = mpsc::channel::<Option<RTCIceCandidate>>(64);
    pc.on_ice_candidate(Box::new(move |candidate| {
        let ice_tx = ice_tx.clone();
        Box::pin(async move {
            let _ = ice_tx.send(candidate).await;
        })
    }));

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: SAMPLE_RATE,
            channels: CHANNELS,
            ..Default::default()
        },
        "audio".to_string(),
        "streama".to_string(),
    ));

    let (frames_tx, frames_rx) = mpsc::channel::<EncodedFrame>(QUEUE_CAPACITY);
    let shared = Arc::new(PeerShared::new());
    let pending = Arc::new(Mutex::new(Some(Peer {
        shared: Arc::clone(&shared),
        frames: frames_tx,
    })));
    wire_lifecycle(
        &pc,
        shared,
        pending,
        state.handoff.clone(),
        Arc::clone(&state.metrics),
    );

    spawn_sender(Arc::clone(&pc), Arc::clone(&track), frames_rx);

    let negotiated = async {
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        tracing::debug!("audio track added");
        spawn_rtcp_drain(rtp_sender);

        pc.set_remote_description(offer).await?;
        tracing::debug!("remote description set");

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        tracing::debug!("local description set");

        Ok::<_, SignalingError>(answer)
    }
    .await;

    match negotiated {
        Ok(answer) => Ok(Negotiation {
            answer,
            candidates: ice_rx,
        }),
        Err(e) => {
            // Tearing the connection down also releases the pending peer and
            // its sender task through the Closed state transition.
            let _ = pc.close().await;
            Err(e)
        }
    }
}

/// Map a connection state to the listener state it implies, if any.
///
/// Failed collapses into Closed: both mean the stack has given up, and the
/// broadcast loop removes the listener on Closed only.
fn target_state(conn_state: RTCPeerConnectionState) -> Option<PeerState> {
    match conn_state {
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => Some(PeerState::Closed),
        _ => None,
    }
}

/// Bind peer-connection state changes to the shared listener state.
///
/// The first transition to Connected hands the listener to the broadcast
/// loop and counts it; later reconnects only touch the gauge. `pending` is
/// the one-shot hand-off slot: taking it also drops the last spare queue
/// handle when the connection dies before ever connecting.
fn wire_lifecycle(
    pc: &RTCPeerConnection,
    shared: Arc<PeerShared>,
    pending: Arc<Mutex<Option<Peer>>>,
    handoff: crossbeam_channel::Sender<Peer>,
    metrics: Arc<MetricsContext>,
) {
    pc.on_peer_connection_state_change(Box::new(move |conn_state| {
        if let Some(next) = target_state(conn_state) {
            shared.set_state(next);

            match shared.state() {
                PeerState::Connected => {
                    if shared.mark_counted() {
                        metrics.current_clients.inc();
                    }
                    let first_connect = pending.lock().ok().and_then(|mut slot| slot.take());
                    if let Some(peer) = first_connect {
                        metrics.total_clients.inc();
                        if handoff.send(peer).is_err() {
                            tracing::warn!("broadcast engine gone, dropping listener");
                        } else {
                            tracing::info!("listener connected");
                        }
                    }
                }
                PeerState::Disconnected => {
                    if shared.clear_counted() {
                        metrics.current_clients.dec();
                    }
                    tracing::debug!("listener disconnected");
                }
                PeerState::Closed => {
                    if shared.clear_counted() {
                        metrics.current_clients.dec();
                    }
                    if let Ok(mut slot) = pending.lock() {
                        slot.take();
                    }
                    tracing::debug!("listener connection ended ({})", conn_state);
                }
            }
        }
        Box::pin(async {})
    }));
}

/// Drain the listener's frame queue into its audio track.
///
/// A write error is not fatal: the connection state will report Closed soon
/// after if the listener is really gone. The task ends when the broadcast
/// loop closes the queue, at which point the peer connection is torn down.
fn spawn_sender(
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    mut frames: mpsc::Receiver<EncodedFrame>,
) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let sample = Sample {
                data: frame.data,
                duration: frame.duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::warn!("track write failed: {}", e);
            }
        }

        tracing::debug!("frame queue closed, closing peer connection");
        if let Err(e) = pc.close().await {
            tracing::debug!("peer connection close: {}", e);
        }
    });
}

/// Read and discard incoming RTCP.
///
/// The packets themselves are worthless here, but interceptor processing
/// (NACK) happens as a side effect of the read. The read failing means the
/// peer connection is being torn down.
fn spawn_rtcp_drain(rtp_sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        tracing::debug!("rtcp drain finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            target_state(RTCPeerConnectionState::Connected),
            Some(PeerState::Connected)
        );
        assert_eq!(
            target_state(RTCPeerConnectionState::Disconnected),
            Some(PeerState::Disconnected)
        );
        assert_eq!(
            target_state(RTCPeerConnectionState::Closed),
            Some(PeerState::Closed)
        );
        assert_eq!(
            target_state(RTCPeerConnectionState::Failed),
            Some(PeerState::Closed)
        );
        assert_eq!(target_state(RTCPeerConnectionState::Connecting), None);
        assert_eq!(target_state(RTCPeerConnectionState::New), None);
    }

    #[test]
    fn test_build_api() {
        assert!(build_api().is_ok());
    }

    #[tokio::test]
    async fn test_peer_connection_creation() {
        let api = build_api().expect("api");
        let pc = api.new_peer_connection(rtc_config()).await;
        assert!(pc.is_ok());
    }
}
