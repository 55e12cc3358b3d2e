//! # Transport Boundary
//!
//! Where finished packets leave the gateway core.
//!
//! ## Components
//! - **PacketSink**: the outbound-packet signal; anything that can take an IPv6 packet
//! - **ChannelSink**: bounded tokio channel implementation, never blocks the caller
//! - **Serial**: async reader/writer for the framed serial link to the mesh root

pub mod serial;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{constants, GatewayError, Result};
use crate::utils::metrics::global_metrics;

/// Destination for outbound IPv6 packets.
///
/// `send` must not block: callers hold timers and event handlers, and a busy transport
/// is reported as an error to be retried later.
pub trait PacketSink: Send + Sync {
    fn send(&self, packet: Vec<u8>) -> Result<()>;
}

impl<T: PacketSink + ?Sized> PacketSink for Arc<T> {
    fn send(&self, packet: Vec<u8>) -> Result<()> {
        (**self).send(packet)
    }
}

/// Bounded channel sink
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl PacketSink for ChannelSink {
    fn send(&self, packet: Vec<u8>) -> Result<()> {
        let len = packet.len();
        match self.tx.try_send(packet) {
            Ok(()) => {
                debug!(bytes = len, "Packet queued for transport");
                global_metrics().packet_sent(len as u64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                global_metrics().send_failure();
                Err(GatewayError::TransportError(constants::ERR_QUEUE_FULL.into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                global_metrics().send_failure();
                Err(GatewayError::TransportError(constants::ERR_QUEUE_CLOSED.into()))
            }
        }
    }
}
