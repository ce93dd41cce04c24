//! HTTP API handlers
//!
//! `POST /sdp` performs the whole signaling exchange on a single request:
//! the response body is a stream of concatenated JSON objects. The SDP
//! answer comes first, then each ICE candidate as it is gathered, optionally
//! a final in-band error object. The client parses objects incrementally;
//! the one round-trip still lets ICE finish afterwards.

use std::convert::Infallible;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::signaling::peer::{accept_offer, Negotiation};
use crate::signaling::server::AppState;

/// Largest SDP offer body accepted
const MAX_OFFER_BYTES: usize = 64 * 1024;

/// Buffered response chunks before the writer blocks on the client
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Handle the signaling endpoint.
///
/// Registered for every method so that anything but POST gets a 404, the
/// same contract the embedded player expects.
pub async fn sdp(State(state): State<AppState>, req: Request) -> Response {
    if req.method() != Method::POST {
        return StatusCode::NOT_FOUND.into_response();
    }
    tracing::debug!("signaling request received");

    let body = match to_bytes(req.into_body(), MAX_OFFER_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)).into_response();
        }
    };

    let offer: RTCSessionDescription = match serde_json::from_slice(&body) {
        Ok(offer) => offer,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)).into_response();
        }
    };
    tracing::debug!("session description decoded");

    let negotiation = match accept_offer(&state, offer).await {
        Ok(negotiation) => negotiation,
        Err(e) => {
            tracing::error!("negotiation failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, Infallible>>(BODY_CHANNEL_CAPACITY);
    tokio::spawn(forward_events(negotiation, body_tx));

    let stream = ReceiverStream::new(body_rx);
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Write the answer, then forward candidates until gathering completes or
/// the client goes away.
async fn forward_events(
    negotiation: Negotiation,
    body_tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let Negotiation {
        answer,
        mut candidates,
    } = negotiation;

    let Some(payload) = frame_json(&answer) else {
        tracing::error!("failed to encode SDP answer");
        return;
    };
    if body_tx.send(Ok(payload)).await.is_err() {
        tracing::debug!("client disconnected before the answer was sent");
        return;
    }
    tracing::debug!("answer sent");

    while let Some(Some(candidate)) = candidates.recv().await {
        let payload = match candidate.to_json() {
            Ok(init) => frame_json(&init),
            Err(e) => {
                tracing::warn!("ICE candidate encode failed: {}", e);
                let _ = body_tx.send(Ok(error_object(&e.to_string()))).await;
                return;
            }
        };

        let Some(payload) = payload else {
            let _ = body_tx.send(Ok(error_object("candidate serialization failed"))).await;
            return;
        };
        if body_tx.send(Ok(payload)).await.is_err() {
            tracing::debug!("client disconnected");
            return;
        }
        tracing::debug!("candidate sent");
    }

    tracing::debug!("candidate gathering complete");
}

/// Serialize one value as a single compact JSON object.
///
/// The wire format is unframed concatenated objects, so the output must not
/// contain newlines or any other separators.
fn frame_json<T: serde::Serialize>(value: &T) -> Option<Bytes> {
    serde_json::to_vec(value).ok().map(Bytes::from)
}

/// The in-band error terminator object
fn error_object(message: &str) -> Bytes {
    let payload = serde_json::to_vec(&serde_json::json!({ "error": message })).unwrap_or_default();
    Bytes::from(payload)
}

/// Serve the Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(buffer) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode error: {}", e),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_fixture() -> RTCSessionDescription {
        serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\ns=-\r\n"}"#)
            .expect("fixture answer")
    }

    #[tokio::test]
    async fn test_answer_is_first_and_single_line() {
        let (ice_tx, candidates) = mpsc::channel(4);
        let (body_tx, mut body_rx) = mpsc::channel(8);

        // Gathering completes immediately
        ice_tx.send(None).await.expect("send completion");
        drop(ice_tx);

        tokio::spawn(forward_events(
            Negotiation {
                answer: answer_fixture(),
                candidates,
            },
            body_tx,
        ));

        let first = body_rx.recv().await.expect("first chunk").expect("bytes");
        assert!(!first.contains(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&first).expect("json");
        assert_eq!(value["type"], "answer");

        // Stream ends after gathering completes
        assert!(body_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_candidate_channel_closes() {
        let (ice_tx, candidates) = mpsc::channel::<Option<_>>(4);
        let (body_tx, mut body_rx) = mpsc::channel(8);

        // Connection torn down before gathering finished
        drop(ice_tx);

        tokio::spawn(forward_events(
            Negotiation {
                answer: answer_fixture(),
                candidates,
            },
            body_tx,
        ));

        assert!(body_rx.recv().await.is_some());
        assert!(body_rx.recv().await.is_none());
    }

    #[test]
    fn test_error_object_shape() {
        let payload = error_object("boom");
        let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value["error"], "boom");
        assert!(!payload.contains(&b'\n'));
    }

    #[test]
    fn test_frame_json_is_compact() {
        let value = serde_json::json!({ "candidate": "candidate:1 1 UDP 1 10.0.0.1 5000 typ host" });
        let payload = frame_json(&value).expect("frame");
        assert!(!payload.contains(&b'\n'));
        assert!(payload.starts_with(b"{"));
        assert!(payload.ends_with(b"}"));
    }
}
