//! End-to-end session scenarios on paused tokio time
//!
//! Each test drives a `SessionController` through notifications and timer expiries and
//! inspects the packets it hands to the transport.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mesh_gateway::config::SessionConfig;
use mesh_gateway::core::coap::{self, CoapMessage, Code, MessageType};
use mesh_gateway::core::packet::{self, UdpDatagram, EPHEMERAL_PORTS};
use mesh_gateway::error::{GatewayError, Result};
use mesh_gateway::protocol::{CorrelationKey, ReplyCorrelator};
use mesh_gateway::service::{
    InMemoryMoteState, MoteState, Neighbor, Session, SessionController, SessionState,
};
use mesh_gateway::transport::{ChannelSink, PacketSink};
use tokio::sync::mpsc;

const PREFIX: [u8; 8] = [0xbb, 0xbb, 0, 0, 0, 0, 0, 0];
const ROOT: [u8; 8] = [0x14, 0x15, 0x92, 0x00, 0x00, 0x00, 0xca, 0xf6];

/// Sink that can be told to fail
struct FlakySink {
    inner: ChannelSink,
    failing: AtomicBool,
}

impl FlakySink {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl PacketSink for FlakySink {
    fn send(&self, packet: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportError("link down".into()));
        }
        self.inner.send(packet)
    }
}

struct Harness {
    controller: SessionController<Arc<FlakySink>, InMemoryMoteState>,
    sink: Arc<FlakySink>,
    packets: mpsc::Receiver<Vec<u8>>,
    motes: InMemoryMoteState,
}

fn harness(seed: u16) -> Harness {
    let (inner, packets) = ChannelSink::channel(16);
    let sink = Arc::new(FlakySink {
        inner,
        failing: AtomicBool::new(false),
    });
    let motes = InMemoryMoteState::new();
    let controller = SessionController::with_session(
        SessionConfig::default(),
        Session::with_message_id_seed(seed),
        ReplyCorrelator::new(),
        sink.clone(),
        motes.clone(),
    );
    Harness {
        controller,
        sink,
        packets,
        motes,
    }
}

fn local_address() -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[..8].copy_from_slice(&PREFIX);
    addr[8..].copy_from_slice(&ROOT);
    addr
}

/// Parse an outbound packet into its datagram and CoAP message.
fn open(packet: &[u8]) -> (UdpDatagram, CoapMessage) {
    let datagram = UdpDatagram::parse(packet).expect("valid IPv6/UDP packet");
    let message = CoapMessage::from_bytes(&datagram.payload).expect("valid CoAP message");
    (datagram, message)
}

fn reply_for(request: &CoapMessage) -> Vec<u8> {
    CoapMessage::request(
        MessageType::NonConfirmable,
        Code::CHANGED,
        request.message_id,
        request.token.clone(),
    )
    .to_bytes()
    .unwrap()
}

/// Run the handshake up to `Registered`.
fn register(h: &mut Harness) {
    h.controller.set_network_prefix(&PREFIX).unwrap();
    h.controller.set_root_identity(&ROOT, true).unwrap();
    let (datagram, hello) = open(&h.packets.try_recv().unwrap());
    let key = CorrelationKey::udp(datagram.src_addr, datagram.src_port);
    assert!(h.controller.deliver_reply(&key, reply_for(&hello)).unwrap());
    assert_eq!(h.controller.state(), SessionState::Registered);
}

async fn sleep_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_hello_sent_once_both_halves_known() {
    let mut h = harness(0x1000);

    h.controller.set_network_prefix(&PREFIX).unwrap();
    assert!(h.packets.try_recv().is_err());
    assert_eq!(h.controller.state(), SessionState::Unregistered);

    h.controller.set_root_identity(&ROOT, true).unwrap();
    let hello = h.packets.try_recv().unwrap();
    assert!(h.packets.try_recv().is_err(), "exactly one hello");
    assert_eq!(h.controller.state(), SessionState::Registering);

    // Repeated notifications do not re-send
    h.controller.set_network_prefix(&PREFIX).unwrap();
    h.controller.set_root_identity(&ROOT, true).unwrap();
    assert!(h.packets.try_recv().is_err());

    let (datagram, message) = open(&hello);
    assert_eq!(datagram.src_addr, local_address());
    assert_eq!(datagram.dst_addr, SessionConfig::default().home_peer_bytes());
    assert_eq!(datagram.dst_port, packet::COAP_DEFAULT_PORT);
    assert!(EPHEMERAL_PORTS.contains(&datagram.src_port));

    assert_eq!(message.message_type, MessageType::NonConfirmable);
    assert_eq!(message.code, Code::POST);
    assert_eq!(message.message_id, 0x1001);
    assert_eq!(message.token.len(), 2);
    assert_eq!(message.uri_path(), "nh/lo");
    assert!(message.payload.is_empty());

    let key = CorrelationKey::udp(datagram.src_addr, datagram.src_port);
    assert_eq!(h.controller.pending_key(), Some(key));
    assert!(h.controller.correlator().is_pending(&key));
}

#[tokio::test(start_paused = true)]
async fn test_root_then_prefix_order() {
    let mut h = harness(0);
    h.controller.set_root_identity(&ROOT, true).unwrap();
    assert!(h.packets.try_recv().is_err());
    h.controller.set_network_prefix(&PREFIX).unwrap();
    assert!(h.packets.try_recv().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_non_root_identity_ignored() {
    let mut h = harness(0);
    h.controller.set_network_prefix(&PREFIX).unwrap();
    h.controller.set_root_identity(&ROOT, false).unwrap();
    assert!(h.packets.try_recv().is_err());
    assert_eq!(h.controller.state(), SessionState::Unregistered);
    assert!(h.controller.local_address().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_length_notifications_rejected() {
    let h = harness(0);
    assert!(matches!(
        h.controller.set_network_prefix(&PREFIX[..7]),
        Err(GatewayError::AddressLength {
            expected: 8,
            actual: 7
        })
    ));
    assert!(matches!(
        h.controller.set_root_identity(&[0u8; 16], true),
        Err(GatewayError::AddressLength {
            expected: 8,
            actual: 16
        })
    ));
    assert_eq!(h.controller.state(), SessionState::Unregistered);
}

#[tokio::test(start_paused = true)]
async fn test_hello_reply_registers_and_arms_report_timer() {
    let mut h = harness(0);
    register(&mut h);

    assert!(h.controller.is_registered());
    assert!(h.controller.pending_key().is_none());
    assert!(h.controller.has_active_timer());
    assert_eq!(h.controller.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_report_skipped_without_neighbor_data() {
    let mut h = harness(0);
    register(&mut h);

    sleep_secs(61).await;

    assert!(h.packets.try_recv().is_err());
    assert_eq!(h.controller.state(), SessionState::Registered);
    assert!(h.controller.has_active_timer());

    // An empty table is treated the same as no table
    h.motes.update("caf6", Vec::new());
    sleep_secs(60).await;
    assert!(h.packets.try_recv().is_err());
    assert_eq!(h.controller.state(), SessionState::Registered);
}

#[tokio::test(start_paused = true)]
async fn test_report_carries_neighbor_rssi() {
    let mut h = harness(0xFFFE);
    register(&mut h);
    h.motes.update("caf6", vec![Neighbor::new([0xaa, 0xbb], -67)]);

    sleep_secs(61).await;

    let report = h.packets.try_recv().unwrap();
    assert_eq!(h.controller.state(), SessionState::Reporting);

    let message = CoapMessage::from_bytes(&report[48..]).unwrap();
    // Hello used 0xFFFF, the report wraps to 0
    assert_eq!(message.message_id, 0);
    assert_eq!(message.code, Code::POST);
    assert_eq!(message.message_type, MessageType::NonConfirmable);
    assert_eq!(message.uri_path(), "nh/rss");
    assert!(message
        .options
        .iter()
        .any(|o| o.number == coap::option::CONTENT_FORMAT
            && o.value == vec![coap::CONTENT_FORMAT_JSON as u8]));

    let body: HashMap<String, i64> = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(body, HashMap::from([("aabb".to_string(), -67)]));
}

#[tokio::test(start_paused = true)]
async fn test_report_reply_via_inbound_packet() {
    let mut h = harness(0);
    register(&mut h);
    h.motes.update(
        "caf6",
        vec![
            Neighbor::new([0x14, 0x15, 0x92, 0, 0, 0, 0x00, 0x01], -40),
            Neighbor::new([0x14, 0x15, 0x92, 0, 0, 0, 0x00, 0x02], -85),
        ],
    );

    sleep_secs(61).await;
    let (datagram, report) = open(&h.packets.try_recv().unwrap());
    let body: HashMap<String, i64> = serde_json::from_slice(&report.payload).unwrap();
    assert_eq!(body.len(), 2);
    assert_eq!(body["0001"], -40);
    assert_eq!(body["0002"], -85);

    // The home peer answers to the report's source address and port
    let reply = packet::build_packet(
        &reply_for(&report),
        &datagram.dst_addr,
        &datagram.src_addr,
        datagram.dst_port,
        datagram.src_port,
    )
    .unwrap();
    assert!(h.controller.on_inbound_packet(&reply).unwrap());
    assert_eq!(h.controller.state(), SessionState::Registered);

    // Duplicates find nothing waiting
    assert!(!h.controller.on_inbound_packet(&reply).unwrap());

    // Next period reports again
    sleep_secs(61).await;
    assert!(h.packets.try_recv().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_inbound_packet_rejected() {
    let mut h = harness(0);
    register(&mut h);

    let mut reply = packet::build_packet(
        b"late",
        &SessionConfig::default().home_peer_bytes(),
        &local_address(),
        5683,
        50000,
    )
    .unwrap();
    let last = reply.len() - 1;
    reply[last] ^= 0xFF;

    assert!(matches!(
        h.controller.on_inbound_packet(&reply),
        Err(GatewayError::MalformedPacket(_))
    ));
    assert!(h.controller.on_inbound_packet(&[0u8; 12]).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_report_reply_timeout_rearms() {
    let mut h = harness(0);
    register(&mut h);
    h.motes.update("caf6", vec![Neighbor::new([0xaa, 0xbb], -67)]);

    sleep_secs(61).await;
    let (datagram, _) = open(&h.packets.try_recv().unwrap());
    let key = CorrelationKey::udp(datagram.src_addr, datagram.src_port);
    assert!(h.controller.correlator().is_pending(&key));

    sleep_secs(30).await;
    assert_eq!(h.controller.state(), SessionState::Registered);
    assert!(!h.controller.correlator().is_pending(&key));
    assert!(h.controller.pending_key().is_none());

    // A late reply is dropped
    assert!(!h.controller.deliver_reply(&key, Vec::new()).unwrap());

    sleep_secs(60).await;
    assert!(h.packets.try_recv().is_ok());
    assert_eq!(h.controller.state(), SessionState::Reporting);
}

#[tokio::test(start_paused = true)]
async fn test_report_send_failure_rearms() {
    let mut h = harness(0);
    register(&mut h);
    h.motes.update("caf6", vec![Neighbor::new([0xaa, 0xbb], -67)]);

    h.sink.set_failing(true);
    sleep_secs(61).await;
    assert!(h.packets.try_recv().is_err());
    assert_eq!(h.controller.state(), SessionState::Registered);
    assert!(h.controller.has_active_timer());
    assert_eq!(h.controller.correlator().pending_count(), 0);

    h.sink.set_failing(false);
    sleep_secs(60).await;
    assert!(h.packets.try_recv().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_hello_retried_until_answered() {
    let mut h = harness(0);
    h.controller.set_network_prefix(&PREFIX).unwrap();
    h.controller.set_root_identity(&ROOT, true).unwrap();
    let (first, first_hello) = open(&h.packets.try_recv().unwrap());
    let first_key = CorrelationKey::udp(first.src_addr, first.src_port);

    sleep_secs(31).await;
    let (second, second_hello) = open(&h.packets.try_recv().unwrap());
    let second_key = CorrelationKey::udp(second.src_addr, second.src_port);

    assert_eq!(h.controller.state(), SessionState::Registering);
    assert_eq!(second_hello.message_id, first_hello.message_id.wrapping_add(1));
    assert_eq!(h.controller.correlator().pending_count(), 1);
    if first_key != second_key {
        assert!(!h.controller.deliver_reply(&first_key, Vec::new()).unwrap());
    }

    assert!(h
        .controller
        .deliver_reply(&second_key, reply_for(&second_hello))
        .unwrap());
    assert_eq!(h.controller.state(), SessionState::Registered);
}

#[tokio::test(start_paused = true)]
async fn test_failed_hello_is_retried() {
    let mut h = harness(0);
    h.sink.set_failing(true);
    h.controller.set_network_prefix(&PREFIX).unwrap();
    h.controller.set_root_identity(&ROOT, true).unwrap();

    assert!(h.packets.try_recv().is_err());
    assert_eq!(h.controller.state(), SessionState::Registering);
    assert!(h.controller.has_active_timer());
    assert_eq!(h.controller.correlator().pending_count(), 0);

    h.sink.set_failing(false);
    sleep_secs(31).await;
    assert!(h.packets.try_recv().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_timer() {
    let mut h = harness(0);
    register(&mut h);
    h.motes.update("caf6", vec![Neighbor::new([0xaa, 0xbb], -67)]);

    h.controller.shutdown();
    assert_eq!(h.controller.state(), SessionState::ShutDown);
    assert!(!h.controller.has_active_timer());

    sleep_secs(600).await;
    assert!(h.packets.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_pending_hello() {
    let mut h = harness(0);
    h.controller.set_network_prefix(&PREFIX).unwrap();
    h.controller.set_root_identity(&ROOT, true).unwrap();
    assert!(h.packets.try_recv().is_ok());
    assert!(h.controller.pending_key().is_some());
    assert_eq!(h.controller.correlator().pending_count(), 1);

    h.controller.shutdown();

    assert!(h.controller.pending_key().is_none());
    assert_eq!(h.controller.correlator().pending_count(), 0);
    sleep_secs(120).await;
    assert!(h.packets.try_recv().is_err());
}

/// Mote state that runs a callback while the session is reading neighbor data
#[derive(Default)]
struct InterruptingMotes {
    on_read: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl MoteState for InterruptingMotes {
    fn neighbors(&self, _short_id: &str) -> Option<Vec<Neighbor>> {
        if let Some(callback) = self.on_read.get() {
            callback();
        }
        Some(vec![Neighbor::new([0xaa, 0xbb], -67)])
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_report_sends_nothing() {
    let (sink, mut packets) = ChannelSink::channel(16);
    let motes = Arc::new(InterruptingMotes::default());
    let controller = SessionController::new(SessionConfig::default(), sink, motes.clone());

    controller.set_network_prefix(&PREFIX).unwrap();
    controller.set_root_identity(&ROOT, true).unwrap();
    let (datagram, hello) = open(&packets.try_recv().unwrap());
    let key = CorrelationKey::udp(datagram.src_addr, datagram.src_port);
    assert!(controller.deliver_reply(&key, reply_for(&hello)).unwrap());
    assert_eq!(controller.state(), SessionState::Registered);

    let stopper = controller.clone();
    assert!(motes
        .on_read
        .set(Box::new(move || stopper.shutdown()))
        .is_ok());

    // The report timer fires and the session is shut down mid-report
    sleep_secs(61).await;

    assert_eq!(controller.state(), SessionState::ShutDown);
    assert!(packets.try_recv().is_err());
    assert!(controller.pending_key().is_none());
    assert_eq!(controller.correlator().pending_count(), 0);
    assert!(!controller.has_active_timer());
}
