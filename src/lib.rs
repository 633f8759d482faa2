//! Roger Resample Library
//!
//! Arbitrary-ratio sample rate conversion for interleaved PCM streams.

pub mod audio;
pub mod decode;
pub mod engine;
pub mod resample;
