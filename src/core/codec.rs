//! # Serial Stream Codec
//!
//! Tokio codec that cuts a raw serial byte stream into flag-delimited frames and
//! hands each one to [`frame::decode`](crate::core::frame::decode).
//!
//! A corrupted frame must not end the stream, so the decoder yields
//! `Ok(Some(Err(..)))` for integrity failures and reserves the outer error for I/O.
//! Bytes before the first flag are line noise and are discarded. Two adjacent flags
//! are treated as a closing flag followed by a new opening flag.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::core::frame::{self, FLAG};
use crate::error::{GatewayError, Result};

/// Default bound on a single escaped frame, flags included
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024;

/// Serial frame codec with a bounded frame size
#[derive(Debug, Clone)]
pub struct HdlcCodec {
    max_frame_size: usize,
}

impl HdlcCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for HdlcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HdlcCodec {
    type Item = Result<Vec<u8>>;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            // Resynchronise on the opening flag
            match src.iter().position(|&b| b == FLAG) {
                Some(0) => {}
                Some(start) => {
                    debug!(discarded = start, "Discarding bytes before frame start");
                    src.advance(start);
                }
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            let Some(offset) = src[1..].iter().position(|&b| b == FLAG) else {
                if src.len() > self.max_frame_size {
                    let len = src.len();
                    warn!(len, max = self.max_frame_size, "Unterminated frame exceeds limit");
                    src.clear();
                    return Ok(Some(Err(GatewayError::OversizedFrame(len))));
                }
                return Ok(None);
            };

            let end = offset + 1;
            if end == 1 {
                // Back-to-back flags: the second one opens the next frame
                src.advance(1);
                continue;
            }

            let raw = src.split_to(end + 1);
            if raw.len() > self.max_frame_size {
                warn!(len = raw.len(), max = self.max_frame_size, "Dropping oversized frame");
                return Ok(Some(Err(GatewayError::OversizedFrame(raw.len()))));
            }

            return Ok(Some(frame::decode(&raw)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    debug!(discarded = src.len(), "Discarding unterminated frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Vec<u8>> for HdlcCodec {
    type Error = GatewayError;

    fn encode(&mut self, payload: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        let encoded = frame::encode(&payload);
        if encoded.len() > self.max_frame_size {
            return Err(GatewayError::OversizedFrame(encoded.len()));
        }
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}
