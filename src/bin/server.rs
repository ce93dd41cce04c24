//! Streama broadcast server
//!
//! Captures audio from one input device and broadcasts it over WebRTC to
//! every listener that connects via POST /sdp.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streama::{
    audio::{self, DeviceCapture},
    broadcast::Broadcaster,
    codec::OpusEncoder,
    constants::SHUTDOWN_GRACE,
    metrics::MetricsContext,
    signaling::{self, peer::build_api, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting streama");

    // Device name: positional argument, then environment, then default input
    let device_name = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STREAMA_DEVICE").ok());

    // Validate the capture device up front; a broken device must fail the
    // process before it accepts any listeners
    let summary = {
        let device = audio::find_input(device_name.as_deref())
            .context("no usable capture device")?;
        audio::validate_input(&device).context("capture device rejected")?
    };
    tracing::info!(
        "capture device: {} ({} channels, default {} Hz)",
        summary.name,
        summary.channels,
        summary.sample_rate
    );

    let encoder = OpusEncoder::new().context("opus encoder init failed")?;
    let capture = DeviceCapture::open(device_name);

    let metrics = Arc::new(MetricsContext::new().context("metrics registry init failed")?);
    let api = Arc::new(build_api().context("webrtc api init failed")?);

    let (handoff_tx, handoff_rx) = crossbeam_channel::unbounded();
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

    let broadcaster = Broadcaster::new(Box::new(capture), encoder, handoff_rx, shutdown_rx);
    let mut engine = tokio::task::spawn_blocking(move || broadcaster.run());

    let state = AppState {
        api,
        metrics,
        handoff: handoff_tx,
    };
    let notify = Arc::new(Notify::new());
    spawn_shutdown_watcher(shutdown_tx, Arc::clone(&notify));

    let server = signaling::server::serve(signaling::router(state), notify);
    tokio::pin!(server);

    tokio::select! {
        result = &mut engine => {
            // The engine only stops mid-serve on a fatal pipeline error or a
            // shutdown race; its final stats are already logged.
            match result {
                Ok(Ok(())) => {
                    tracing::info!("broadcast engine stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(e).context("broadcast engine failed"),
                Err(e) => Err(anyhow::anyhow!("broadcast engine panicked: {}", e)),
            }
        }
        result = &mut server => {
            result.context("http server failed")?;
            match engine.await {
                Ok(Ok(())) => {
                    tracing::info!("shut down cleanly");
                    Ok(())
                }
                Ok(Err(e)) => Err(e).context("broadcast engine failed"),
                Err(e) => Err(anyhow::anyhow!("broadcast engine panicked: {}", e)),
            }
        }
    }
}

/// Trigger shutdown on SIGINT/SIGTERM: stop the broadcast loop, let the
/// server finish in-flight requests, and force-exit after the grace period.
fn spawn_shutdown_watcher(shutdown_tx: crossbeam_channel::Sender<()>, notify: Arc<Notify>) {
    tokio::spawn(async move {
        let interrupt = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(_) => std::future::pending().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => {}
            _ = terminate => {}
        }

        tracing::info!("shutdown signal received");
        drop(shutdown_tx);
        notify.notify_one();

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::warn!("shutdown grace period elapsed, exiting");
        std::process::exit(0);
    });
}
