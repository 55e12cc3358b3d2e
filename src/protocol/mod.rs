//! # Mesh Protocol State
//!
//! Shared, lock-protected state the gateway consults while moving packets.
//!
//! ## Components
//! - **Routing**: parent table and source route resolution toward the mesh root
//! - **Correlator**: single-fire matching of inbound replies to outstanding requests

pub mod correlator;
pub mod routing;

pub use correlator::{CorrelationKey, ReplyCorrelator};
pub use routing::{NodeAddress, RouteResolver, SourceRoute};
