//! Length-prefixed framing for non-blocking TCP streams.
//!
//! Every frame on the wire is a length-prefixed payload:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. A length of 0 is a
//! valid empty frame.
//!
//! Streams never block, so a frame may arrive in pieces: [`FrameDecoder`]
//! accumulates bytes until a whole frame is present, and [`FramedStream`]
//! keeps unsent output around until the OS accepts it.

use crate::socket::TcpStreamHandle;

const PREFIX_LEN: usize = 4;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 64 KB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 65_536,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8], config: &FrameConfig) -> Result<Vec<u8>, FrameError> {
    let len = payload.len() as u64;
    if len > u64::from(config.max_payload_size) {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reassembles frames from a byte stream that arrives in arbitrary pieces.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame, if one has fully arrived.
    ///
    /// An oversized length prefix is reported as soon as the prefix itself is
    /// complete; the stream cannot be resynchronized after that.
    pub fn next_frame(&mut self, config: &FrameConfig) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(prefix) = self.buffer.first_chunk::<PREFIX_LEN>() else {
            return Ok(None);
        };
        let len = u32::from_le_bytes(*prefix);
        if len > config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: u64::from(len),
                max: config.max_payload_size,
            });
        }
        let end = PREFIX_LEN + len as usize;
        if self.buffer.len() < end {
            return Ok(None);
        }
        let payload = self.buffer[PREFIX_LEN..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(payload))
    }
}

/// A TCP stream carrying length-prefixed frames.
#[derive(Debug)]
pub struct FramedStream {
    stream: TcpStreamHandle,
    decoder: FrameDecoder,
    outgoing: Vec<u8>,
    config: FrameConfig,
}

impl FramedStream {
    pub fn new(stream: TcpStreamHandle, config: FrameConfig) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            outgoing: Vec::new(),
            config,
        }
    }

    pub fn stream(&self) -> &TcpStreamHandle {
        &self.stream
    }

    /// Queue one frame and push as much output as the OS will take.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(payload, &self.config)?;
        self.outgoing.extend_from_slice(&frame);
        self.flush()
    }

    /// Write queued output without blocking.
    pub fn flush(&mut self) -> Result<(), FrameError> {
        while !self.outgoing.is_empty() {
            let written = self.stream.send(&self.outgoing)?;
            if written == 0 {
                break;
            }
            self.outgoing.drain(..written);
        }
        Ok(())
    }

    /// Whether output is still waiting for the OS.
    pub fn has_pending_output(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Read everything available and return the frames it completed.
    ///
    /// Frames completed before the peer closed the stream are returned first;
    /// the close is reported on the following call.
    pub fn poll_frames(&mut self) -> Result<Vec<Vec<u8>>, FrameError> {
        self.flush()?;
        let mut buf = [0u8; 4096];
        let mut closed = false;
        loop {
            match self.stream.receive(&mut buf)? {
                Some(0) => {
                    closed = true;
                    break;
                }
                Some(n) => self.decoder.extend(&buf[..n]),
                None => break,
            }
        }

        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.next_frame(&self.config)? {
            frames.push(frame);
        }
        if closed && frames.is_empty() {
            return Err(FrameError::ConnectionClosed);
        }
        Ok(frames)
    }
}
