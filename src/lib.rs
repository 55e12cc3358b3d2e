//! # Mesh Gateway
//!
//! Gateway core between a 6TiSCH-style mesh network and an external IPv6 network.
//!
//! The gateway talks to the mesh root over a byte-stuffed, CRC-protected serial link,
//! resolves source routes down the mesh from the parent table, wraps outbound
//! application payloads in IPv6/UDP headers, and runs a small CoAP session that
//! registers with a home peer and periodically reports the root's neighbor telemetry.
//!
//! ## Layout
//! - [`core`](crate::core): frame codec, packet translator, CoAP messages
//! - [`protocol`]: route resolver and reply correlator
//! - [`service`]: session controller and event loop
//! - [`transport`]: outbound packet sink and the serial link
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
