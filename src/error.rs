//! # Error Types
//!
//! Error handling for the gateway core.
//!
//! This module defines every error variant that can surface from framing, routing,
//! packet translation, reply correlation and the session controller.
//!
//! ## Error Categories
//! - **Framing Errors**: CRC mismatch, missing flags, dangling escapes, oversized frames
//! - **Routing Errors**: no path from a destination to the mesh root
//! - **Packet Errors**: malformed addresses or datagrams, CoAP encoding problems
//! - **Session Errors**: duplicate correlations, invalid state, transport unavailability
//! - **Configuration Errors**: invalid static configuration, caught at startup
//!
//! None of these is fatal to the process. Session-level failures are turned into a
//! rescheduled retry by the session controller.
//!
//! ## Example Usage
//! ```rust
//! use mesh_gateway::core::frame;
//! use mesh_gateway::error::GatewayError;
//!
//! let bytes = [0x7E, 0x01, 0x02, 0x03, 0x7E];
//! match frame::decode(&bytes) {
//!     Ok(payload) => println!("payload: {payload:02x?}"),
//!     Err(GatewayError::FrameIntegrity(reason)) => println!("discarding frame: {reason}"),
//!     Err(e) => println!("unexpected error: {e}"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_MISSING_OPENING_FLAG: &str = "frame does not start with a flag byte";
    pub const ERR_MISSING_CLOSING_FLAG: &str = "frame does not end with a flag byte";
    pub const ERR_DANGLING_ESCAPE: &str = "escape byte at end of frame";
    pub const ERR_FRAME_TOO_SHORT: &str = "frame shorter than its checksum";
    pub const ERR_CRC_MISMATCH: &str = "CRC-16 mismatch";

    /// Packet errors
    pub const ERR_DATAGRAM_TOO_SHORT: &str = "datagram shorter than IPv6 + UDP headers";
    pub const ERR_NOT_IPV6: &str = "not an IPv6 packet";
    pub const ERR_NOT_UDP: &str = "next header is not UDP";
    pub const ERR_LENGTH_MISMATCH: &str = "length field does not match datagram size";
    pub const ERR_UDP_CHECKSUM: &str = "UDP checksum mismatch";

    /// Synchronization
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_CORRELATOR_LOCK: &str = "Failed to acquire lock on reply correlator";
    pub const ERR_ROUTING_READ_LOCK: &str = "Failed to acquire read lock on routing table";
    pub const ERR_ROUTING_WRITE_LOCK: &str = "Failed to acquire write lock on routing table";

    /// Transport
    pub const ERR_QUEUE_FULL: &str = "outbound packet queue is full";
    pub const ERR_QUEUE_CLOSED: &str = "outbound packet queue is closed";

    /// Session
    pub const ERR_SESSION_SHUT_DOWN: &str = "session has been shut down";
}

// GatewayError is the error type for all gateway operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Frame integrity error: {0}")]
    FrameIntegrity(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("No route to {0}")]
    NoRoute(String),

    #[error("Invalid address length: expected {expected} bytes, got {actual}")]
    AddressLength { expected: usize, actual: usize },

    #[error("Request already pending for {0}")]
    DuplicateCorrelation(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("CoAP error: {0}")]
    Coap(String),

    #[error("JSON error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::AddressLength {
            expected: 16,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "Invalid address length: expected 16 bytes, got 4"
        );

        let err = GatewayError::FrameIntegrity(constants::ERR_CRC_MISMATCH.into());
        assert_eq!(err.to_string(), "Frame integrity error: CRC-16 mismatch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "serial port gone");
        let err: GatewayError = io_err.into();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
