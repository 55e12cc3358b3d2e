//! Registration and telemetry session with the home peer.
//!
//! ```text
//! Unregistered --(prefix + root known)--> Registering --(hello reply)--> Registered
//!      Registered --(report timer)--> Reporting --(reply | failure | timeout)--> Registered
//!      any --(shutdown)--> ShutDown
//! ```
//!
//! All mutable session fields live in one [`Session`] behind a single mutex. The lock is
//! only held for read-modify-write steps and is always released before a packet is handed
//! to the transport. Exactly one timer is active at a time: a registration retry while
//! registering, the report period while registered, or a reply timeout while reporting.
//! Re-arming aborts the previous timer, and every timer carries a generation number so a
//! late firing of a replaced timer is ignored.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::core::coap::{self, CoapMessage, Code, MessageType};
use crate::core::packet::{self, UdpDatagram};
use crate::error::{constants, GatewayError, Result};
use crate::protocol::correlator::{CorrelationKey, ReplyCorrelator};
use crate::protocol::routing::{format_address, NodeAddress};
use crate::service::mote_state::{short_id, MoteState};
use crate::transport::PacketSink;
use crate::utils::metrics::global_metrics;

/// Length of the network prefix and of the root identifier
pub const PREFIX_LEN: usize = 8;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registering,
    Registered,
    Reporting,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    RegistrationRetry,
    Report,
    ReplyTimeout,
}

#[derive(Debug)]
struct ActiveTimer {
    purpose: TimerPurpose,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Mutable state of the gateway's relationship with the home peer
#[derive(Debug)]
pub struct Session {
    network_prefix: Option<[u8; PREFIX_LEN]>,
    root_id: Option<NodeAddress>,
    last_message_id: u16,
    registered: bool,
    state: SessionState,
    pending: Option<CorrelationKey>,
    timer: Option<ActiveTimer>,
    timer_generation: u64,
}

impl Session {
    /// New session with a random message-id seed.
    pub fn new() -> Self {
        Self::with_message_id_seed(rand::random())
    }

    pub fn with_message_id_seed(seed: u16) -> Self {
        Self {
            network_prefix: None,
            root_id: None,
            last_message_id: seed,
            registered: false,
            state: SessionState::Unregistered,
            pending: None,
            timer: None,
            timer_generation: 0,
        }
    }

    /// Advance and return the message identifier, wrapping from `0xFFFF` to `0`.
    pub fn next_message_id(&mut self) -> u16 {
        self.last_message_id = self.last_message_id.wrapping_add(1);
        self.last_message_id
    }

    pub fn last_message_id(&self) -> u16 {
        self.last_message_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Full IPv6 address of the root: network prefix followed by the root identifier.
    pub fn local_address(&self) -> Option<[u8; 16]> {
        let (prefix, root) = (self.network_prefix?, self.root_id?);
        let mut addr = [0u8; 16];
        addr[..PREFIX_LEN].copy_from_slice(&prefix);
        addr[PREFIX_LEN..].copy_from_slice(&root);
        Some(addr)
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            info!(from = ?self.state, to = ?to, "Session state transition");
            self.state = to;
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            debug!(purpose = ?timer.purpose, "Cancelling session timer");
            timer.handle.abort();
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner<S, M> {
    config: SessionConfig,
    session: Mutex<Session>,
    correlator: ReplyCorrelator,
    sink: S,
    mote_state: M,
}

/// Drives the registration handshake and the periodic telemetry loop.
///
/// Cheap to clone; clones share the same session. Timers are tokio tasks, so the
/// notification methods must be called from within a tokio runtime.
pub struct SessionController<S, M> {
    inner: Arc<Inner<S, M>>,
}

impl<S, M> Clone for SessionController<S, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, M> SessionController<S, M>
where
    S: PacketSink + 'static,
    M: MoteState + 'static,
{
    pub fn new(config: SessionConfig, sink: S, mote_state: M) -> Self {
        Self::with_session(config, Session::new(), ReplyCorrelator::new(), sink, mote_state)
    }

    /// Build a controller around an existing session and correlator.
    pub fn with_session(
        config: SessionConfig,
        session: Session,
        correlator: ReplyCorrelator,
        sink: S,
        mote_state: M,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session: Mutex::new(session),
                correlator,
                sink,
                mote_state,
            }),
        }
    }

    pub fn correlator(&self) -> &ReplyCorrelator {
        &self.inner.correlator
    }

    pub fn state(&self) -> SessionState {
        self.lock().map(|s| s.state).unwrap_or(SessionState::ShutDown)
    }

    pub fn is_registered(&self) -> bool {
        self.lock().map(|s| s.registered).unwrap_or(false)
    }

    pub fn local_address(&self) -> Option<[u8; 16]> {
        self.lock().ok()?.local_address()
    }

    /// Correlation key of the request currently awaiting a reply, if any.
    pub fn pending_key(&self) -> Option<CorrelationKey> {
        self.lock().ok()?.pending
    }

    /// Whether a session timer is armed.
    pub fn has_active_timer(&self) -> bool {
        self.lock().map(|s| s.timer.is_some()).unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        self.inner
            .session
            .lock()
            .map_err(|_| GatewayError::Custom(constants::ERR_LOCK_POISONED.into()))
    }

    /// Record the mesh network prefix (the upper 64 bits of mesh addresses).
    ///
    /// # Errors
    /// Returns `GatewayError::AddressLength` unless `prefix` is 8 bytes.
    #[instrument(skip(self, prefix), fields(prefix = %format_address(prefix)))]
    pub fn set_network_prefix(&self, prefix: &[u8]) -> Result<()> {
        let prefix: [u8; PREFIX_LEN] =
            prefix
                .try_into()
                .map_err(|_| GatewayError::AddressLength {
                    expected: PREFIX_LEN,
                    actual: prefix.len(),
                })?;
        {
            let mut session = self.lock()?;
            if let Some(existing) = session.network_prefix {
                if existing != prefix {
                    warn!(
                        existing = %format_address(&existing),
                        "Network prefix changed; keeping session addressing"
                    );
                }
                return Ok(());
            }
            session.network_prefix = Some(prefix);
            info!("Network prefix set");
        }
        self.maybe_start_registration()
    }

    /// Record the mesh root's identifier. Notifications for non-root motes are ignored.
    ///
    /// # Errors
    /// Returns `GatewayError::AddressLength` unless `node_id` is 8 bytes.
    #[instrument(skip(self, node_id), fields(node = %format_address(node_id)))]
    pub fn set_root_identity(&self, node_id: &[u8], is_root: bool) -> Result<()> {
        if !is_root {
            debug!("Ignoring identity of non-root mote");
            return Ok(());
        }
        let root: NodeAddress = node_id
            .try_into()
            .map_err(|_| GatewayError::AddressLength {
                expected: PREFIX_LEN,
                actual: node_id.len(),
            })?;
        {
            let mut session = self.lock()?;
            if session.root_id.is_some() {
                debug!("Root identity already known");
                return Ok(());
            }
            session.root_id = Some(root);
            info!("Root identity set");
        }
        self.maybe_start_registration()
    }

    fn maybe_start_registration(&self) -> Result<()> {
        {
            let mut session = self.lock()?;
            if session.state != SessionState::Unregistered || session.local_address().is_none() {
                return Ok(());
            }
            session.transition(SessionState::Registering);
        }
        self.send_hello();
        Ok(())
    }

    /// Hand a reply for `key` to the correlator. Returns whether it matched.
    pub fn deliver_reply(&self, key: &CorrelationKey, data: Vec<u8>) -> Result<bool> {
        self.inner.correlator.deliver(key, data)
    }

    /// Parse an IPv6/UDP packet from the external network and deliver its payload to
    /// the request it answers.
    ///
    /// # Errors
    /// Returns `GatewayError::MalformedPacket` if the packet does not parse or its
    /// checksum is wrong.
    pub fn on_inbound_packet(&self, packet: &[u8]) -> Result<bool> {
        let datagram = UdpDatagram::parse(packet).inspect_err(|e| {
            global_metrics().inbound_rejected();
            debug!(error = %e, "Rejecting inbound packet");
        })?;
        let key = CorrelationKey::udp(datagram.dst_addr, datagram.dst_port);
        self.deliver_reply(&key, datagram.payload)
    }

    /// Stop the session: cancel the timer and abandon any pending request.
    pub fn shutdown(&self) {
        let pending = match self.lock() {
            Ok(mut session) => {
                session.cancel_timer();
                session.transition(SessionState::ShutDown);
                session.pending.take()
            }
            Err(_) => None,
        };
        if let Some(key) = pending {
            self.abandon(&key);
        }
        info!("Session shut down");
    }

    /// Drop the correlation entry for a request that will never be answered.
    fn abandon(&self, key: &CorrelationKey) {
        if let Err(e) = self.inner.correlator.cancel(key) {
            warn!(%key, error = %e, "Failed to abandon pending request");
        }
    }

    fn next_message_id(&self) -> Result<u16> {
        Ok(self.lock()?.next_message_id())
    }

    fn random_token() -> Vec<u8> {
        rand::rng().random::<u16>().to_be_bytes().to_vec()
    }

    /// Register for the reply, then send `message` to the home peer.
    ///
    /// On success the new key becomes the session's pending request, replacing (and
    /// abandoning) any previous one.
    fn send_request<F>(&self, message: CoapMessage, on_reply: F) -> Result<CorrelationKey>
    where
        F: FnOnce(&Self, CorrelationKey, Vec<u8>) + Send + 'static,
    {
        let (source, previous) = {
            let mut session = self.lock()?;
            if session.state == SessionState::ShutDown {
                return Err(GatewayError::InvalidState(constants::ERR_SESSION_SHUT_DOWN.into()));
            }
            let source = session.local_address().ok_or_else(|| {
                GatewayError::InvalidState("local address not yet known".into())
            })?;
            (source, session.pending.take())
        };
        if let Some(previous) = previous {
            self.inner.correlator.cancel(&previous)?;
        }

        let payload = message.to_bytes()?;
        let port = packet::random_ephemeral_port();
        let key = CorrelationKey::udp(source, port);

        let weak: Weak<Inner<S, M>> = Arc::downgrade(&self.inner);
        self.inner.correlator.await_reply(key, move |data| {
            if let Some(inner) = weak.upgrade() {
                on_reply(&SessionController { inner }, key, data);
            }
        })?;
        {
            // shutdown() may have run while the lock was released
            let mut session = self.lock()?;
            if session.state == SessionState::ShutDown {
                drop(session);
                self.abandon(&key);
                return Err(GatewayError::InvalidState(constants::ERR_SESSION_SHUT_DOWN.into()));
            }
            session.pending = Some(key);
        }

        let sent = packet::build_packet(
            &payload,
            &source,
            &self.inner.config.home_peer_bytes(),
            port,
            self.inner.config.peer_port,
        )
        .and_then(|pkt| self.inner.sink.send(pkt));

        if let Err(e) = sent {
            self.abandon(&key);
            let mut session = self.lock()?;
            if session.pending == Some(key) {
                session.pending = None;
            }
            return Err(e);
        }

        debug!(%key, message_id = message.message_id, path = %message.uri_path(), "Request sent");
        Ok(key)
    }

    #[instrument(skip(self))]
    fn send_hello(&self) {
        let result = self.next_message_id().and_then(|message_id| {
            let hello = CoapMessage::request(
                MessageType::NonConfirmable,
                Code::POST,
                message_id,
                Self::random_token(),
            )
            .with_uri_path(&self.inner.config.registration_path);
            self.send_request(hello, |ctl, key, data| ctl.on_hello_reply(key, data))
        });

        match result {
            Ok(_) => info!("Hello sent to home peer"),
            Err(e) => warn!(error = %e, "Failed to send hello to home peer"),
        }

        let retry = self.inner.config.registration_retry;
        if let Ok(mut session) = self.lock() {
            if session.state == SessionState::Registering {
                self.arm_timer(&mut session, TimerPurpose::RegistrationRetry, retry);
            }
        }
    }

    fn on_hello_reply(&self, key: CorrelationKey, data: Vec<u8>) {
        let Ok(mut session) = self.lock() else {
            return;
        };
        if session.state != SessionState::Registering || session.pending != Some(key) {
            debug!(%key, "Ignoring stale hello reply");
            return;
        }
        log_reply_code(&data);
        session.pending = None;
        session.registered = true;
        session.transition(SessionState::Registered);
        global_metrics().registration();
        info!("Registered with home peer");

        let interval = self.inner.config.reporting_interval;
        self.arm_timer(&mut session, TimerPurpose::Report, interval);
    }

    /// Build the JSON telemetry body for the root's neighbor table.
    ///
    /// Returns `None` when no neighbor data is available.
    fn telemetry_payload(&self, root_short_id: &str) -> Result<Option<Vec<u8>>> {
        let neighbors = match self.inner.mote_state.neighbors(root_short_id) {
            Some(neighbors) if !neighbors.is_empty() => neighbors,
            _ => return Ok(None),
        };
        let report: BTreeMap<String, i8> = neighbors
            .iter()
            .map(|n| (n.short_id(), n.rssi))
            .collect();
        Ok(Some(serde_json::to_vec(&report)?))
    }

    #[instrument(skip(self))]
    fn send_report(&self) {
        let root_short_id = match self.lock() {
            Ok(session) => session.root_id.map(|root| short_id(&root)),
            Err(_) => return,
        };
        let Some(root_short_id) = root_short_id else {
            return;
        };

        let payload = match self.telemetry_payload(&root_short_id) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                warn!(mote = %root_short_id, "No neighbor data; skipping telemetry report");
                global_metrics().report_skipped();
                self.back_to_registered();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode telemetry report");
                self.back_to_registered();
                return;
            }
        };

        let result = self.next_message_id().and_then(|message_id| {
            let report = CoapMessage::request(
                MessageType::NonConfirmable,
                Code::POST,
                message_id,
                Self::random_token(),
            )
            .with_uri_path(&self.inner.config.reporting_path)
            .with_content_format(coap::CONTENT_FORMAT_JSON)
            .with_payload(payload);
            self.send_request(report, |ctl, key, data| ctl.on_report_reply(key, data))
        });

        match result {
            Ok(_) => {
                global_metrics().report_sent();
                info!("Telemetry report sent");
                let timeout = self.inner.config.reply_timeout;
                if let Ok(mut session) = self.lock() {
                    if session.state == SessionState::Reporting {
                        self.arm_timer(&mut session, TimerPurpose::ReplyTimeout, timeout);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to send telemetry report; retrying next period");
                self.back_to_registered();
            }
        }
    }

    fn on_report_reply(&self, key: CorrelationKey, data: Vec<u8>) {
        let Ok(mut session) = self.lock() else {
            return;
        };
        if session.state != SessionState::Reporting || session.pending != Some(key) {
            debug!(%key, "Ignoring stale report reply");
            return;
        }
        log_reply_code(&data);
        session.pending = None;
        session.transition(SessionState::Registered);

        let interval = self.inner.config.reporting_interval;
        self.arm_timer(&mut session, TimerPurpose::Report, interval);
    }

    /// Return from `Reporting` to `Registered` and wait a full period.
    fn back_to_registered(&self) {
        let interval = self.inner.config.reporting_interval;
        if let Ok(mut session) = self.lock() {
            if session.state == SessionState::Reporting {
                session.transition(SessionState::Registered);
                self.arm_timer(&mut session, TimerPurpose::Report, interval);
            }
        }
    }

    fn arm_timer(&self, session: &mut Session, purpose: TimerPurpose, delay: Duration) {
        session.cancel_timer();
        session.timer_generation += 1;
        let generation = session.timer_generation;

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionController { inner }.on_timer(purpose, generation);
            }
        });

        debug!(?purpose, delay_secs = delay.as_secs(), "Session timer armed");
        session.timer = Some(ActiveTimer {
            purpose,
            generation,
            handle,
        });
    }

    fn on_timer(&self, purpose: TimerPurpose, generation: u64) {
        let abandoned = {
            let Ok(mut session) = self.lock() else {
                return;
            };
            match &session.timer {
                Some(timer) if timer.generation == generation => {}
                _ => return,
            }
            // The task is finishing on its own; just forget the handle
            session.timer = None;

            match (purpose, session.state) {
                (TimerPurpose::RegistrationRetry, SessionState::Registering) => {
                    info!("No hello reply; retrying registration");
                    session.pending.take()
                }
                (TimerPurpose::Report, SessionState::Registered) => {
                    session.transition(SessionState::Reporting);
                    None
                }
                (TimerPurpose::ReplyTimeout, SessionState::Reporting) => {
                    warn!("Telemetry reply timed out; retrying next period");
                    global_metrics().reply_timeout();
                    session.transition(SessionState::Registered);
                    let interval = self.inner.config.reporting_interval;
                    self.arm_timer(&mut session, TimerPurpose::Report, interval);
                    session.pending.take()
                }
                _ => return,
            }
        };

        if let Some(key) = abandoned {
            self.abandon(&key);
        }

        match purpose {
            TimerPurpose::RegistrationRetry => self.send_hello(),
            TimerPurpose::Report => self.send_report(),
            TimerPurpose::ReplyTimeout => {}
        }
    }
}

fn log_reply_code(data: &[u8]) {
    match CoapMessage::from_bytes(data) {
        Ok(reply) if reply.code.is_success() => debug!(code = %reply.code, "Reply received"),
        Ok(reply) => warn!(code = %reply.code, "Home peer replied with non-success code"),
        Err(_) => debug!(bytes = data.len(), "Reply is not a CoAP message"),
    }
}

impl<S, M> std::fmt::Debug for SessionController<S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("config", &self.inner.config)
            .field("correlator", &self.inner.correlator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_wraps() {
        let mut session = Session::with_message_id_seed(0xFFFE);
        assert_eq!(session.next_message_id(), 0xFFFF);
        assert_eq!(session.next_message_id(), 0);
        assert_eq!(session.next_message_id(), 1);
    }

    #[test]
    fn test_local_address_needs_both_halves() {
        let mut session = Session::with_message_id_seed(0);
        assert!(session.local_address().is_none());
        session.network_prefix = Some([0xbb, 0xbb, 0, 0, 0, 0, 0, 0]);
        assert!(session.local_address().is_none());
        session.root_id = Some([0x14, 0x15, 0x92, 0, 0, 0, 0xca, 0xf6]);
        assert_eq!(
            session.local_address(),
            Some([
                0xbb, 0xbb, 0, 0, 0, 0, 0, 0, 0x14, 0x15, 0x92, 0, 0, 0, 0xca, 0xf6
            ])
        );
    }

    #[test]
    fn test_new_session_is_unregistered() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Unregistered);
        assert!(!session.is_registered());
    }
}
