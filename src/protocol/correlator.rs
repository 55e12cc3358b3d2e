use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::core::packet::IANA_UDP;
use crate::error::{constants, GatewayError, Result};
use crate::protocol::routing::format_address;
use crate::utils::metrics::global_metrics;

type ReplyFn = dyn FnOnce(Vec<u8>) + Send + 'static;

/// Identifies which outstanding request an inbound notification answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Local address the request was sent from (and the reply is addressed to)
    pub address: [u8; 16],
    /// Transport protocol number
    pub protocol: u8,
    /// Ephemeral source port of the request
    pub port: u16,
}

impl CorrelationKey {
    pub fn udp(address: [u8; 16], port: u16) -> Self {
        Self {
            address,
            protocol: IANA_UDP,
            port,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]/{}/{}",
            format_address(&self.address),
            self.protocol,
            self.port
        )
    }
}

/// Keyed, single-fire reply registrations.
///
/// A callback is removed from the table before it runs, so it fires at most once and
/// may itself register a new request without deadlocking.
#[derive(Clone, Default)]
pub struct ReplyCorrelator {
    pending: Arc<Mutex<HashMap<CorrelationKey, Box<ReplyFn>>>>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `on_reply` to run when a reply for `key` is delivered.
    ///
    /// # Errors
    /// Returns `GatewayError::DuplicateCorrelation` if `key` is already pending.
    pub fn await_reply<F>(&self, key: CorrelationKey, on_reply: F) -> Result<()>
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| GatewayError::Custom(constants::ERR_CORRELATOR_LOCK.into()))?;

        if pending.contains_key(&key) {
            warn!(%key, "Request already pending for key");
            return Err(GatewayError::DuplicateCorrelation(key.to_string()));
        }

        pending.insert(key, Box::new(on_reply));
        debug!(%key, "Awaiting reply");
        Ok(())
    }

    /// Deliver `data` to whoever is waiting on `key`.
    ///
    /// Returns `true` if a callback ran. Unmatched deliveries are dropped.
    pub fn deliver(&self, key: &CorrelationKey, data: Vec<u8>) -> Result<bool> {
        let callback = self
            .pending
            .lock()
            .map_err(|_| GatewayError::Custom(constants::ERR_CORRELATOR_LOCK.into()))?
            .remove(key);

        match callback {
            Some(on_reply) => {
                debug!(%key, bytes = data.len(), "Reply matched pending request");
                global_metrics().reply_matched();
                on_reply(data);
                Ok(true)
            }
            None => {
                debug!(%key, "Dropping reply with no pending request");
                global_metrics().reply_unmatched();
                Ok(false)
            }
        }
    }

    /// Abandon a registration without running its callback.
    pub fn cancel(&self, key: &CorrelationKey) -> Result<bool> {
        let removed = self
            .pending
            .lock()
            .map_err(|_| GatewayError::Custom(constants::ERR_CORRELATOR_LOCK.into()))?
            .remove(key)
            .is_some();
        if removed {
            debug!(%key, "Abandoned pending request");
        }
        Ok(removed)
    }

    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains_key(key))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl fmt::Debug for ReplyCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyCorrelator")
            .field("pending", &self.pending_count())
            .finish()
    }
}
