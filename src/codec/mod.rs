//! Opus codec wrapper
//!
//! Provides low-latency Opus encoding for the broadcast pipeline.

pub mod encoder;

pub use encoder::OpusEncoder;
