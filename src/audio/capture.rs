//! Audio capture from the input device
//!
//! The capture stream runs in its own dedicated thread for low latency; the
//! broadcast loop pulls complete frames out of it with a blocking `read`, so
//! the device clock paces the whole pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::audio::device::find_input;
use crate::constants::{CHANNELS, SAMPLE_RATE};
use crate::error::AudioError;

/// How long `read` waits for the device before declaring the stream dead
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the callback-to-reader chunk channel
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// A suspendable source of fixed-size PCM frames.
///
/// `read` fills the buffer with interleaved 16-bit samples and blocks for one
/// frame duration of wall clock. Implemented by [`DeviceCapture`] for real
/// hardware and by the synthetic sources in [`crate::testing`] for tests.
pub trait CaptureSource: Send {
    /// Start (or resume) capturing. Idempotent.
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop capturing and release the device. Idempotent.
    fn abort(&mut self);

    /// Fill `buf` with the next frame of interleaved i16 samples.
    ///
    /// Blocks until the device has delivered enough audio. Errors are fatal
    /// to the pipeline.
    fn read(&mut self, buf: &mut [i16]) -> Result<(), AudioError>;
}

/// Capture source backed by a cpal input device
pub struct DeviceCapture {
    /// Exact device name; `None` selects the default input
    device_name: Option<String>,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Sample chunks from the stream callback
    data_rx: Option<Receiver<Vec<i16>>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<AudioError>>,

    /// Samples received but not yet handed out as a frame
    pending: VecDeque<i16>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,
}

impl DeviceCapture {
    /// Create a capture source for the named device (or the default input).
    ///
    /// The device itself is resolved lazily inside the capture thread on each
    /// `start`, so a capture can outlive device suspend/resume cycles.
    pub fn open(device_name: Option<String>) -> Self {
        Self {
            device_name,
            running: Arc::new(AtomicBool::new(false)),
            data_rx: None,
            error_rx: None,
            pending: VecDeque::new(),
            thread_handle: None,
        }
    }
}

impl CaptureSource for DeviceCapture {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (data_tx, data_rx) = bounded::<Vec<i16>>(CHUNK_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.data_rx = Some(data_rx);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let device_name = self.device_name.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let device = match find_input(device_name.as_deref()) {
                    Ok(d) => d,
                    Err(e) => {
                        let _ = error_tx.try_send(e);
                        return;
                    }
                };

                let config = StreamConfig {
                    channels: CHANNELS,
                    sample_rate: cpal::SampleRate(SAMPLE_RATE),
                    buffer_size: cpal::BufferSize::Default,
                };

                let callback_error_tx = error_tx.clone();
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }

                        let chunk: Vec<i16> = data
                            .iter()
                            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                            .collect();

                        // Non-blocking: the audio callback must never stall
                        let _ = data_tx.try_send(chunk);
                    },
                    move |err| {
                        let _ = callback_error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                            return;
                        }

                        // Keep thread alive while running
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }

                        // Stream is dropped here, stopping capture
                    }
                    Err(e) => {
                        let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn abort(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        // Stale audio must not leak into the next session
        self.data_rx = None;
        self.error_rx = None;
        self.pending.clear();
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<(), AudioError> {
        let data_rx = self
            .data_rx
            .as_ref()
            .ok_or_else(|| AudioError::StreamError("capture not started".to_string()))?;

        while self.pending.len() < buf.len() {
            if let Some(error_rx) = &self.error_rx {
                if let Ok(e) = error_rx.try_recv() {
                    return Err(e);
                }
            }

            match data_rx.recv_timeout(READ_TIMEOUT) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(AudioError::StreamError("capture stalled".to_string()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::StreamError("capture thread exited".to_string()));
                }
            }
        }

        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }

        Ok(())
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_SAMPLES;

    #[test]
    fn test_open_does_not_touch_hardware() {
        let capture = DeviceCapture::open(Some("streama-test-no-such-device".to_string()));
        assert!(!capture.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_abort_is_idempotent() {
        let mut capture = DeviceCapture::open(None);
        capture.abort();
        capture.abort();
    }

    #[test]
    fn test_read_before_start_fails() {
        let mut capture = DeviceCapture::open(None);
        let mut buf = vec![0i16; FRAME_SAMPLES];
        assert!(capture.read(&mut buf).is_err());
    }

    #[test]
    fn test_missing_device_surfaces_from_read() {
        let mut capture = DeviceCapture::open(Some("streama-test-no-such-device".to_string()));
        capture.start().expect("spawning the capture thread should work");

        let mut buf = vec![0i16; FRAME_SAMPLES];
        assert!(capture.read(&mut buf).is_err());
    }
}
