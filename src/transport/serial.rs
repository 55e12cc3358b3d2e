//! Framed serial link to the mesh root.
//!
//! Works over any `AsyncRead`/`AsyncWrite` pair (a serial port, a pty, an in-memory duplex
//! in tests). Inbound frames that fail their integrity check are counted and skipped; the
//! link keeps running.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

use crate::core::codec::HdlcCodec;
use crate::error::Result;

/// Summary of a finished read loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_delivered: u64,
    pub frames_rejected: u64,
}

/// Read frames from `reader` and forward each payload to `upstream` until the reader
/// hits EOF, `upstream` is closed, or `shutdown_rx` fires.
///
/// # Errors
/// Only I/O errors on `reader` end the loop with an error.
#[instrument(skip_all, fields(max_frame_size = codec.max_frame_size()))]
pub async fn run_reader<R>(
    reader: R,
    codec: HdlcCodec,
    upstream: mpsc::Sender<Vec<u8>>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<LinkStats>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, codec);
    let mut stats = LinkStats::default();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Serial reader shutting down");
                return Ok(stats);
            }

            next = frames.next() => {
                match next {
                    Some(Ok(Ok(payload))) => {
                        debug!(bytes = payload.len(), "Frame received");
                        stats.frames_delivered += 1;
                        if upstream.send(payload).await.is_err() {
                            info!("Upstream closed, stopping serial reader");
                            return Ok(stats);
                        }
                    }
                    Some(Ok(Err(e))) => {
                        stats.frames_rejected += 1;
                        warn!(error = %e, "Discarding serial frame");
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        info!("Serial link closed");
                        return Ok(stats);
                    }
                }
            }
        }
    }
}

/// Framed writer half of the serial link
pub struct SerialWriter<W> {
    framed: FramedWrite<W, HdlcCodec>,
}

impl<W> SerialWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, codec: HdlcCodec) -> Self {
        Self {
            framed: FramedWrite::new(writer, codec),
        }
    }

    /// Frame and flush one payload.
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        self.framed.send(payload).await
    }

    pub fn into_inner(self) -> W {
        self.framed.into_inner()
    }
}
