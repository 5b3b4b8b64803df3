//! # Audio Chunk Buffer
//!
//! Accumulates the binary frames a client sends between two turn boundaries.
//! The buffer is opaque to the container format: chunks are stored exactly as
//! received and handed to the pipeline as one contiguous payload.
//!
//! ## Key Properties:
//! - **Arrival order**: chunks are concatenated in the order they were appended
//! - **Move-out flush**: [`AudioBuffer::take`] moves the bytes out and leaves the
//!   buffer empty, so a turn can never observe bytes of another turn
//! - **Single owner**: the buffer belongs to one session and needs no locking

/// Ordered, append-only collection of audio chunks.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    chunks: Vec<Vec<u8>>,
    total_bytes: usize,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one binary frame. Empty frames are kept out of the chunk list.
    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk.to_vec());
    }

    /// Move the accumulated payload out, leaving the buffer empty.
    ///
    /// ## Rust Concepts:
    /// - **std::mem::take**: swaps in `Default::default()` and returns the old value,
    ///   so the chunks are moved rather than cloned
    pub fn take(&mut self) -> Vec<u8> {
        let chunks = std::mem::take(&mut self.chunks);
        let mut payload = Vec::with_capacity(self.total_bytes);
        for chunk in chunks {
            payload.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;
        payload
    }

    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
