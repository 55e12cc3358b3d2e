//! # IPv6/UDP Translation
//!
//! Wraps an application payload in UDP-over-IPv6 headers for delivery to an external
//! IPv6 peer, and parses datagrams coming back from that peer.
//!
//! ## Wire Format
//! ```text
//! IPv6 (40): [0x60 00 00 00] [payload_len(2)] [next_header=17] [hop_limit=64] [src(16)] [dst(16)]
//! UDP   (8): [src_port(2)] [dst_port(2)] [length(2)] [checksum(2)]
//! ```
//!
//! The UDP header is built first over the raw application payload; the IPv6 header is then
//! built over `udp_header || payload` and copies its payload length from the UDP length field.
//! The checksum covers the RFC 8200 pseudo-header, the UDP header and the payload.

use rand::Rng;
use std::ops::RangeInclusive;

use crate::error::{constants, GatewayError, Result};

/// IANA protocol number for UDP
pub const IANA_UDP: u8 = 17;

/// CoAP default port
pub const COAP_DEFAULT_PORT: u16 = 5683;

/// Hop limit on outbound packets
pub const HOP_LIMIT: u8 = 64;

/// IPv6 base header length
pub const IPV6_HEADER_LEN: usize = 40;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// IPv6 address length
pub const ADDRESS_LEN: usize = 16;

/// Dynamic/private port range (RFC 6335)
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Pick an ephemeral source port uniformly from [`EPHEMERAL_PORTS`].
pub fn random_ephemeral_port() -> u16 {
    rand::rng().random_range(EPHEMERAL_PORTS)
}

fn check_address(addr: &[u8]) -> Result<[u8; ADDRESS_LEN]> {
    addr.try_into().map_err(|_| GatewayError::AddressLength {
        expected: ADDRESS_LEN,
        actual: addr.len(),
    })
}

/// One's complement sum over a sequence of byte slices, as if concatenated.
///
/// Returns the complemented sum; a result of zero is *not* remapped here.
pub fn internet_checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut pending: Option<u8> = None;

    for part in parts {
        for &byte in part.iter() {
            match pending.take() {
                Some(high) => sum += u32::from(u16::from_be_bytes([high, byte])),
                None => pending = Some(byte),
            }
        }
    }
    if let Some(high) = pending {
        sum += u32::from(high) << 8;
    }

    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_header(src: &[u8; ADDRESS_LEN], dst: &[u8; ADDRESS_LEN], udp_len: u32) -> [u8; 40] {
    let mut pseudo = [0u8; 40];
    pseudo[..16].copy_from_slice(src);
    pseudo[16..32].copy_from_slice(dst);
    pseudo[32..36].copy_from_slice(&udp_len.to_be_bytes());
    pseudo[36..40].copy_from_slice(&u32::from(IANA_UDP).to_be_bytes());
    pseudo
}

/// Build the 8-byte UDP header for `payload`.
///
/// # Errors
/// Returns `GatewayError::AddressLength` unless both addresses are 16 bytes, and
/// `GatewayError::MalformedPacket` if the payload does not fit a UDP length field.
pub fn build_udp_header(
    payload: &[u8],
    src_addr: &[u8],
    dst_addr: &[u8],
    src_port: u16,
    dst_port: u16,
) -> Result<[u8; UDP_HEADER_LEN]> {
    let src = check_address(src_addr)?;
    let dst = check_address(dst_addr)?;

    let udp_len = u16::try_from(UDP_HEADER_LEN + payload.len()).map_err(|_| {
        GatewayError::MalformedPacket(format!("payload too large: {} bytes", payload.len()))
    })?;

    let mut header = [0u8; UDP_HEADER_LEN];
    header[0..2].copy_from_slice(&src_port.to_be_bytes());
    header[2..4].copy_from_slice(&dst_port.to_be_bytes());
    header[4..6].copy_from_slice(&udp_len.to_be_bytes());

    let pseudo = pseudo_header(&src, &dst, u32::from(udp_len));
    let checksum = match internet_checksum(&[&pseudo, &header[..6], payload]) {
        0 => 0xFFFF,
        sum => sum,
    };
    header[6..8].copy_from_slice(&checksum.to_be_bytes());

    Ok(header)
}

/// Build the 40-byte IPv6 header for `udp_datagram` (UDP header followed by its payload).
///
/// The payload-length field is copied from the UDP length field.
///
/// # Errors
/// Returns `GatewayError::AddressLength` unless both addresses are 16 bytes, and
/// `GatewayError::MalformedPacket` if `udp_datagram` is shorter than a UDP header.
pub fn build_ipv6_header(
    udp_datagram: &[u8],
    src_addr: &[u8],
    dst_addr: &[u8],
) -> Result<[u8; IPV6_HEADER_LEN]> {
    let src = check_address(src_addr)?;
    let dst = check_address(dst_addr)?;

    if udp_datagram.len() < UDP_HEADER_LEN {
        return Err(GatewayError::MalformedPacket(
            "IPv6 payload must start with a UDP header".into(),
        ));
    }

    let mut header = [0u8; IPV6_HEADER_LEN];
    // Version 6, traffic class 0 (default PHB, no ECN), flow label 0
    header[0] = 6 << 4;
    header[4..6].copy_from_slice(&udp_datagram[4..6]);
    header[6] = IANA_UDP;
    header[7] = HOP_LIMIT;
    header[8..24].copy_from_slice(&src);
    header[24..40].copy_from_slice(&dst);

    Ok(header)
}

/// Compose `ipv6_header || udp_header || payload`.
pub fn build_packet(
    payload: &[u8],
    src_addr: &[u8],
    dst_addr: &[u8],
    src_port: u16,
    dst_port: u16,
) -> Result<Vec<u8>> {
    let udp = build_udp_header(payload, src_addr, dst_addr, src_port, dst_port)?;

    let mut datagram = Vec::with_capacity(IPV6_HEADER_LEN + UDP_HEADER_LEN + payload.len());
    datagram.extend_from_slice(&udp);
    datagram.extend_from_slice(payload);

    let ipv6 = build_ipv6_header(&datagram, src_addr, dst_addr)?;

    let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + datagram.len());
    packet.extend_from_slice(&ipv6);
    packet.extend_from_slice(&datagram);
    Ok(packet)
}

/// A parsed inbound IPv6/UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_addr: [u8; ADDRESS_LEN],
    pub dst_addr: [u8; ADDRESS_LEN],
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    /// Parse an IPv6 packet carrying UDP directly after the base header.
    ///
    /// Extension headers are not supported. A zero UDP checksum is rejected, as
    /// IPv6 makes the checksum mandatory.
    ///
    /// # Errors
    /// Returns `GatewayError::MalformedPacket` on any structural or checksum problem.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < IPV6_HEADER_LEN + UDP_HEADER_LEN {
            return Err(GatewayError::MalformedPacket(
                constants::ERR_DATAGRAM_TOO_SHORT.into(),
            ));
        }
        if packet[0] >> 4 != 6 {
            return Err(GatewayError::MalformedPacket(constants::ERR_NOT_IPV6.into()));
        }
        if packet[6] != IANA_UDP {
            return Err(GatewayError::MalformedPacket(constants::ERR_NOT_UDP.into()));
        }

        let ip_payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        let datagram = &packet[IPV6_HEADER_LEN..];
        let udp_len = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
        if ip_payload_len != datagram.len() || udp_len != datagram.len() {
            return Err(GatewayError::MalformedPacket(
                constants::ERR_LENGTH_MISMATCH.into(),
            ));
        }

        let mut src_addr = [0u8; ADDRESS_LEN];
        let mut dst_addr = [0u8; ADDRESS_LEN];
        src_addr.copy_from_slice(&packet[8..24]);
        dst_addr.copy_from_slice(&packet[24..40]);

        let received = u16::from_be_bytes([datagram[6], datagram[7]]);
        let pseudo = pseudo_header(&src_addr, &dst_addr, udp_len as u32);
        let computed = match internet_checksum(&[&pseudo, &datagram[..6], &datagram[8..]]) {
            0 => 0xFFFF,
            sum => sum,
        };
        if received != computed {
            return Err(GatewayError::MalformedPacket(format!(
                "{}: computed {computed:#06x}, received {received:#06x}",
                constants::ERR_UDP_CHECKSUM
            )));
        }

        Ok(Self {
            src_addr,
            dst_addr,
            src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
            dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
            payload: datagram[UDP_HEADER_LEN..].to_vec(),
        })
    }
}
