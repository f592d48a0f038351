//! Incremental UTF-8 decoding for text stream pass-through.
//!
//! Upstream SSE bytes arrive on arbitrary TCP chunk boundaries, so a
//! multi-byte code point can be split across two reads. The decoder carries
//! the incomplete tail between chunks and emits only whole characters.

/// Chunk payload flowing from upstream to client.
///
/// Text chunks have been through the UTF-8 decoder; binary chunks (Bedrock's
/// `vnd.amazon.eventstream`) are forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Binary(bytes::Bytes),
}

impl Chunk {
    /// Bytes to write to the client.
    pub fn into_bytes(self) -> bytes::Bytes {
        match self {
            Chunk::Text(text) => bytes::Bytes::from(text),
            Chunk::Binary(bytes) => bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Text(text) => text.is_empty(),
            Chunk::Binary(bytes) => bytes.is_empty(),
        }
    }
}

/// Streaming UTF-8 decoder with a carry buffer for split code points.
///
/// # Example
///
/// ```
/// use llm_proxy::streaming::Utf8ChunkDecoder;
///
/// let mut decoder = Utf8ChunkDecoder::new();
/// // "é" is 0xC3 0xA9; feed the bytes one at a time.
/// assert_eq!(decoder.decode(&[0xC3]), "");
/// assert_eq!(decoder.decode(&[0xA9]), "é");
/// ```
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    carry: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self { carry: Vec::new() }
    }

    /// Feed raw bytes, returning the longest decodable prefix. A trailing
    /// incomplete sequence stays in the carry buffer; genuinely invalid
    /// bytes are replaced rather than stalling the stream.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        if self.carry.is_empty() {
            match std::str::from_utf8(chunk) {
                Ok(text) => return text.to_string(),
                Err(_) => self.carry.extend_from_slice(chunk),
            }
        } else {
            self.carry.extend_from_slice(chunk);
        }

        match std::str::from_utf8(&self.carry) {
            Ok(text) => {
                let out = text.to_string();
                self.carry.clear();
                out
            }
            Err(err) => {
                if err.error_len().is_some() {
                    // Invalid sequence mid-buffer: emit lossily and reset.
                    let out = String::from_utf8_lossy(&self.carry).into_owned();
                    self.carry.clear();
                    out
                } else {
                    let valid = err.valid_up_to();
                    let out = String::from_utf8_lossy(&self.carry[..valid]).into_owned();
                    self.carry.drain(..valid);
                    out
                }
            }
        }
    }

    /// Drain whatever remains after upstream EOF, lossily.
    pub fn flush(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let out = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        out
    }
}
