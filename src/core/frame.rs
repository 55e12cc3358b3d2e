//! # Serial Frame Codec
//!
//! HDLC-like byte stuffing with a CRC-16 trailer, used on the serial link between
//! the gateway and the mesh root node.
//!
//! ## Wire Format
//! ```text
//! [0x7E] escaped( payload || crc_lo || crc_hi ) [0x7E]
//! ```
//!
//! Inside the flags, every `0x7E` or `0x7D` byte is sent as `0x7D, byte ^ 0x20`.
//! The CRC is the CCITT FCS-16 (reflected polynomial `0x8408`, initial value `0xFFFF`,
//! final complement) computed over the un-escaped payload and stored low byte first.
//!
//! Encoding and decoding take no locks. Their only side effect is bumping the global
//! frame counters in [`crate::utils::metrics`]. The CRC lookup table is built at compile time.

use crate::error::{constants, GatewayError, Result};
use crate::utils::metrics::global_metrics;

/// Frame delimiter
pub const FLAG: u8 = 0x7E;

/// Escape marker
pub const ESCAPE: u8 = 0x7D;

/// XOR mask applied to escaped bytes
pub const ESCAPE_MASK: u8 = 0x20;

/// Initial CRC register value
pub const CRC_INIT: u16 = 0xFFFF;

/// Size of the CRC trailer in bytes
pub const CRC_LEN: usize = 2;

const fn build_fcs16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static FCS16_TABLE: [u16; 256] = build_fcs16_table();

/// Compute the FCS-16 of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    let crc = data.iter().fold(CRC_INIT, |crc, &byte| {
        (crc >> 8) ^ FCS16_TABLE[((crc ^ byte as u16) & 0xFF) as usize]
    });
    !crc
}

#[inline]
fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if byte == FLAG || byte == ESCAPE {
        out.push(ESCAPE);
        out.push(byte ^ ESCAPE_MASK);
    } else {
        out.push(byte);
    }
}

/// Frame `payload` for the serial link.
///
/// Always succeeds. The output is at least 4 bytes (two flags plus the CRC).
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let crc = crc16(payload).to_le_bytes();

    // Worst case every byte is escaped
    let mut out = Vec::with_capacity(2 * (payload.len() + CRC_LEN) + 2);
    out.push(FLAG);
    for &byte in payload.iter().chain(crc.iter()) {
        push_escaped(&mut out, byte);
    }
    out.push(FLAG);

    global_metrics().frame_encoded();
    out
}

/// Decode one complete frame, flags included.
///
/// # Errors
/// Returns `GatewayError::FrameIntegrity` when either flag is missing, an escape byte
/// ends the frame, the frame is too short to hold a CRC, or the CRC does not match.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let result = decode_inner(frame);
    match &result {
        Ok(_) => global_metrics().frame_decoded(),
        Err(_) => global_metrics().frame_rejected(),
    }
    result
}

fn decode_inner(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.first() != Some(&FLAG) {
        return Err(GatewayError::FrameIntegrity(
            constants::ERR_MISSING_OPENING_FLAG.into(),
        ));
    }
    if frame.len() < 2 || frame.last() != Some(&FLAG) {
        return Err(GatewayError::FrameIntegrity(
            constants::ERR_MISSING_CLOSING_FLAG.into(),
        ));
    }

    let body = &frame[1..frame.len() - 1];
    let mut unescaped = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            let next = bytes.next().ok_or_else(|| {
                GatewayError::FrameIntegrity(constants::ERR_DANGLING_ESCAPE.into())
            })?;
            unescaped.push(next ^ ESCAPE_MASK);
        } else {
            unescaped.push(byte);
        }
    }

    if unescaped.len() < CRC_LEN {
        return Err(GatewayError::FrameIntegrity(
            constants::ERR_FRAME_TOO_SHORT.into(),
        ));
    }

    let split = unescaped.len() - CRC_LEN;
    let received = u16::from_le_bytes([unescaped[split], unescaped[split + 1]]);
    unescaped.truncate(split);

    let computed = crc16(&unescaped);
    if computed != received {
        return Err(GatewayError::FrameIntegrity(format!(
            "{}: computed {computed:#06x}, received {received:#06x}",
            constants::ERR_CRC_MISMATCH
        )));
    }

    Ok(unescaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/X-25 check value
        assert_eq!(crc16(b"123456789"), 0x906E);
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn test_encode_known_frames() {
        assert_eq!(encode(&[0x53]), vec![0x7E, 0x53, 0x66, 0x90, 0x7E]);
        assert_eq!(encode(&[]), vec![0x7E, 0x00, 0x00, 0x7E]);
        assert_eq!(
            encode(&[0x7E, 0x7D, 0x01]),
            vec![0x7E, 0x7D, 0x5E, 0x7D, 0x5D, 0x01, 0x3A, 0x07, 0x7E]
        );
    }

    #[test]
    fn test_codec_counts_frames() {
        // Counters are process-wide and other tests run in parallel
        let before = global_metrics().snapshot();
        let frame = encode(b"count me");
        assert!(decode(&frame).is_ok());
        assert!(decode(&frame[..frame.len() - 2]).is_err());
        let after = global_metrics().snapshot();

        assert!(after.frames_encoded > before.frames_encoded);
        assert!(after.frames_decoded > before.frames_decoded);
        assert!(after.frames_rejected > before.frames_rejected);
    }

    #[test]
    fn test_escaped_body_has_no_raw_flags() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let frame = encode(&payload);
        assert!(!frame[1..frame.len() - 1].contains(&FLAG));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_roundtrip() {
        let payload = [0x53, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA];
        assert_eq!(decode(&encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn test_decode_rejects_missing_flags() {
        let frame = encode(b"abc");
        assert!(matches!(
            decode(&frame[1..]),
            Err(GatewayError::FrameIntegrity(_))
        ));
        assert!(matches!(
            decode(&frame[..frame.len() - 1]),
            Err(GatewayError::FrameIntegrity(_))
        ));
        assert!(matches!(
            decode(&[FLAG]),
            Err(GatewayError::FrameIntegrity(_))
        ));
        assert!(matches!(decode(&[]), Err(GatewayError::FrameIntegrity(_))));
    }

    #[test]
    fn test_decode_rejects_dangling_escape() {
        let frame = [FLAG, 0x01, 0x02, ESCAPE, FLAG];
        match decode(&frame) {
            Err(GatewayError::FrameIntegrity(reason)) => {
                assert_eq!(reason, constants::ERR_DANGLING_ESCAPE)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(matches!(
            decode(&[FLAG, 0x01, FLAG]),
            Err(GatewayError::FrameIntegrity(_))
        ));
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut frame = encode(b"telemetry");
        frame[3] ^= 0x01;
        assert!(matches!(
            decode(&frame),
            Err(GatewayError::FrameIntegrity(_))
        ));
    }
}
