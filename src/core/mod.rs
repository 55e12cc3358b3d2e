//! # Core Wire Components
//!
//! Stateless encoders and decoders for everything the gateway puts on a wire.
//!
//! ## Components
//! - **Frame**: byte stuffing + CRC-16 for the serial link to the mesh root
//! - **Codec**: Tokio codec that cuts a serial byte stream into frames
//! - **Packet**: IPv6/UDP header synthesis and parsing with checksum computation
//! - **CoAP**: the small subset of RFC 7252 used by the registration session
//!
//! ## Wire Formats
//! ```text
//! serial:  [0x7E] escaped(payload || crc16) [0x7E]
//! ipv6:    [IPv6(40)] [UDP(8)] [CoAP(N)]
//! ```
//!
//! All functions here are pure and safe to call concurrently.

pub mod coap;
pub mod codec;
pub mod frame;
pub mod packet;
