//! Neighbor telemetry as seen by the session controller.
//!
//! The real neighbor tables live with whatever component talks to the motes; the session
//! only needs to look one up by the root's short identifier. [`InMemoryMoteState`] is a
//! simple shared store that such a component can keep current.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// One row of a mote's neighbor table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Neighbor address (16-bit, 64-bit or full 128-bit form)
    pub address: Vec<u8>,
    /// Received signal strength, dBm
    pub rssi: i8,
}

impl Neighbor {
    pub fn new(address: impl Into<Vec<u8>>, rssi: i8) -> Self {
        Self {
            address: address.into(),
            rssi,
        }
    }

    /// Short identifier of this neighbor, see [`short_id`].
    pub fn short_id(&self) -> String {
        short_id(&self.address)
    }
}

/// Lowercase hex of the last two bytes of `address`.
///
/// Addresses shorter than two bytes are rendered in full.
pub fn short_id(address: &[u8]) -> String {
    let start = address.len().saturating_sub(2);
    let mut out = String::with_capacity(4);
    for byte in &address[start..] {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Source of per-mote neighbor tables.
pub trait MoteState: Send + Sync {
    /// Neighbor table of the mote identified by `short_id`, or `None` if no usable
    /// table is known.
    fn neighbors(&self, short_id: &str) -> Option<Vec<Neighbor>>;
}

impl<T: MoteState + ?Sized> MoteState for Arc<T> {
    fn neighbors(&self, short_id: &str) -> Option<Vec<Neighbor>> {
        (**self).neighbors(short_id)
    }
}

/// Thread-safe in-memory neighbor tables keyed by short identifier
#[derive(Debug, Clone, Default)]
pub struct InMemoryMoteState {
    tables: Arc<RwLock<HashMap<String, Vec<Neighbor>>>>,
}

impl InMemoryMoteState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the neighbor table for `short_id`.
    pub fn update(&self, short_id: impl Into<String>, neighbors: Vec<Neighbor>) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(short_id.into(), neighbors);
        }
    }

    pub fn remove(&self, short_id: &str) {
        if let Ok(mut tables) = self.tables.write() {
            tables.remove(short_id);
        }
    }
}

impl MoteState for InMemoryMoteState {
    fn neighbors(&self, short_id: &str) -> Option<Vec<Neighbor>> {
        self.tables.read().ok()?.get(short_id).cloned()
    }
}
