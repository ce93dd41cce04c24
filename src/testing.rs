//! Synthetic capture sources for offline testing
//!
//! These stand in for a real input device so the broadcast pipeline can be
//! exercised without audio hardware. They honor the same contract as the
//! device-backed source: `read` blocks one frame duration and fills the
//! buffer with interleaved stereo samples.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::audio::CaptureSource;
use crate::constants::{FRAME_DURATION, SAMPLE_RATE};
use crate::error::AudioError;

/// Observation handle onto a synthetic source, shared with the test body
/// while the source itself is owned by the broadcast loop.
#[derive(Clone)]
pub struct SourceProbe {
    running: Arc<AtomicBool>,
    frames_read: Arc<AtomicU64>,
}

impl SourceProbe {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::SeqCst)
    }
}

/// Capture source producing a stereo sine tone at the given frequency
pub struct SineSource {
    frequency: f32,
    sample_index: u64,
    running: Arc<AtomicBool>,
    frames_read: Arc<AtomicU64>,
}

impl SineSource {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            sample_index: 0,
            running: Arc::new(AtomicBool::new(false)),
            frames_read: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn probe(&self) -> SourceProbe {
        SourceProbe {
            running: Arc::clone(&self.running),
            frames_read: Arc::clone(&self.frames_read),
        }
    }
}

impl CaptureSource for SineSource {
    fn start(&mut self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<(), AudioError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::StreamError("source not started".to_string()));
        }

        // The wall clock stands in for the device clock
        thread::sleep(FRAME_DURATION);

        for frame in buf.chunks_mut(2) {
            let t = self.sample_index as f32 / SAMPLE_RATE as f32;
            let value =
                ((t * self.frequency * 2.0 * std::f32::consts::PI).sin() * 0.5 * i16::MAX as f32)
                    as i16;
            for sample in frame {
                *sample = value;
            }
            self.sample_index += 1;
        }

        self.frames_read.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Capture source producing silence
pub struct SilenceSource {
    running: Arc<AtomicBool>,
    frames_read: Arc<AtomicU64>,
}

impl SilenceSource {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            frames_read: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn probe(&self) -> SourceProbe {
        SourceProbe {
            running: Arc::clone(&self.running),
            frames_read: Arc::clone(&self.frames_read),
        }
    }
}

impl Default for SilenceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for SilenceSource {
    fn start(&mut self) -> Result<(), AudioError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<(), AudioError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::StreamError("source not started".to_string()));
        }

        thread::sleep(FRAME_DURATION);
        buf.fill(0);
        self.frames_read.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
