//! # Audio Handling
//!
//! Everything a chat turn does with raw audio before it reaches a recognizer:
//!
//! - **buffer**: accumulates binary WebSocket frames between turn boundaries
//! - **artifact**: staged temporary files with RAII cleanup
//! - **normalize**: WAV/PCM decoding, mono mixdown, resampling to 16 kHz

pub mod artifact;
pub mod buffer;
pub mod normalize;

pub use artifact::StagingArea;
pub use buffer::AudioBuffer;
