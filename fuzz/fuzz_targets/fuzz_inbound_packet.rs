#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_gateway::core::coap::CoapMessage;
use mesh_gateway::core::packet::UdpDatagram;

fuzz_target!(|data: &[u8]| {
    // Fuzz inbound IPv6/UDP parsing and the CoAP reply decoder
    if let Ok(datagram) = UdpDatagram::parse(data) {
        let _ = CoapMessage::from_bytes(&datagram.payload);
    }
    let _ = CoapMessage::from_bytes(data);
});
