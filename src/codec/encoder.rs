//! Opus encoder wrapper

use opus::{Application, Channels, Encoder};

use crate::constants::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::CodecError;

/// Opus encoder for the broadcast stream.
///
/// Fixed configuration: 48kHz stereo, VoIP application profile, one 10ms
/// frame per call. Owned exclusively by the broadcast loop; the underlying
/// libopus encoder is not safe for concurrent use.
pub struct OpusEncoder {
    encoder: Encoder,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new encoder with the broadcast configuration
    pub fn new() -> Result<Self, CodecError> {
        let encoder = Encoder::new(SAMPLE_RATE, Channels::Stereo, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Ok(Self {
            encoder,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode one frame of interleaved i16 PCM into `out`.
    ///
    /// Input must be exactly [`FRAME_SAMPLES`] samples. Returns the number of
    /// bytes written to `out`.
    pub fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, CodecError> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode(pcm, out)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(size)
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_PACKET_BYTES;

    #[test]
    fn test_encoder_creation() {
        let encoder = OpusEncoder::new();
        assert!(encoder.is_ok());
    }

    #[test]
    fn test_encode_silence() {
        let mut encoder = OpusEncoder::new().expect("encoder creation failed");
        let silence = vec![0i16; FRAME_SAMPLES];
        let mut out = vec![0u8; MAX_PACKET_BYTES];

        let size = encoder.encode(&silence, &mut out).expect("encode failed");
        assert!(size > 0);
        // Opus compresses silence very efficiently
        assert!(size < 100);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_encode_invalid_frame_size() {
        let mut encoder = OpusEncoder::new().expect("encoder creation failed");
        let wrong_size = vec![0i16; FRAME_SAMPLES / 2];
        let mut out = vec![0u8; MAX_PACKET_BYTES];

        let result = encoder.encode(&wrong_size, &mut out);
        assert!(matches!(result, Err(CodecError::InvalidFrameSize(_))));
    }

    #[test]
    fn test_encode_tone() {
        let mut encoder = OpusEncoder::new().expect("encoder creation failed");

        // Interleaved stereo sine at 440Hz
        let mut tone = Vec::with_capacity(FRAME_SAMPLES);
        for i in 0..FRAME_SAMPLES / 2 {
            let t = i as f32 / SAMPLE_RATE as f32;
            let sample = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 16000.0) as i16;
            tone.push(sample);
            tone.push(sample);
        }

        let mut out = vec![0u8; MAX_PACKET_BYTES];
        let size = encoder.encode(&tone, &mut out).expect("encode failed");
        assert!(size > 0);
        assert!(size <= MAX_PACKET_BYTES);
    }
}
