//! # Gateway Services
//!
//! Long-running behavior built on the core and protocol layers.
//!
//! ## Components
//! - **Session**: registration with the home peer and periodic neighbor telemetry
//! - **Events**: channel-driven loop that feeds bus notifications into the session
//! - **MoteState**: lookup of per-mote neighbor tables

pub mod events;
pub mod mote_state;
pub mod session;

pub use events::{run_event_loop, GatewayEvent};
pub use mote_state::{InMemoryMoteState, MoteState, Neighbor};
pub use session::{Session, SessionController, SessionState};
