//! # CoAP Messages
//!
//! Minimal RFC 7252 message encoder/decoder covering what the gateway session sends and
//! receives: a fixed 4-byte header, an optional token, delta-encoded options and an
//! optional payload behind the `0xFF` marker. Block-wise transfer, observe and
//! confirmable retransmission are out of scope.
//!
//! ```text
//! [ver(2)|type(2)|tkl(4)] [code(8)] [message_id(16)] [token(0..8)] [options...] [0xFF payload]
//! ```

use crate::error::{GatewayError, Result};

/// CoAP protocol version
pub const VERSION: u8 = 1;

/// Payload marker
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Maximum token length
pub const MAX_TOKEN_LEN: usize = 8;

/// Option numbers used by the gateway
pub mod option {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
}

/// `application/json` content format identifier
pub const CONTENT_FORMAT_JSON: u16 = 50;

/// Message type (header bits 4-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Message code as `class.detail`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code {
    pub class: u8,
    pub detail: u8,
}

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const CREATED: Code = Code::new(2, 1);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const fn new(class: u8, detail: u8) -> Self {
        Self { class, detail }
    }

    pub fn to_byte(self) -> u8 {
        (self.class << 5) | (self.detail & 0x1F)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self::new(byte >> 5, byte & 0x1F)
    }

    pub fn is_request(self) -> bool {
        self.class == 0 && self.detail != 0
    }

    pub fn is_success(self) -> bool {
        self.class == 2
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class, self.detail)
    }
}

/// A single option instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    /// Create a request with no options and no payload.
    pub fn request(
        message_type: MessageType,
        code: Code,
        message_id: u16,
        token: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Append one Uri-Path option per non-empty `/`-separated segment of `path`.
    pub fn with_uri_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.options.push(CoapOption {
                number: option::URI_PATH,
                value: segment.as_bytes().to_vec(),
            });
        }
        self
    }

    pub fn with_content_format(mut self, format: u16) -> Self {
        self.options.push(CoapOption {
            number: option::CONTENT_FORMAT,
            value: encode_uint(format),
        });
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Rejoin the Uri-Path options with `/`.
    pub fn uri_path(&self) -> String {
        self.options
            .iter()
            .filter(|o| o.number == option::URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Serialize to the binary wire format.
    ///
    /// # Errors
    /// Returns `GatewayError::Coap` if the token is longer than 8 bytes or an option value
    /// exceeds the encodable length.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(GatewayError::Coap(format!(
                "token too long: {} bytes",
                self.token.len()
            )));
        }

        let mut out = Vec::with_capacity(4 + self.token.len() + 16 + self.payload.len() + 1);
        out.push((VERSION << 6) | (self.message_type.bits() << 4) | self.token.len() as u8);
        out.push(self.code.to_byte());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        // Options go out in ascending number order; equal numbers keep insertion order
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for opt in options {
            let delta = opt.number - previous;
            let (delta_nibble, delta_ext) = encode_option_field(delta as usize)?;
            let (len_nibble, len_ext) = encode_option_field(opt.value.len())?;
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&opt.value);
            previous = opt.number;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }

        Ok(out)
    }

    /// Parse a message from the binary wire format.
    ///
    /// # Errors
    /// Returns `GatewayError::Coap` on a bad version, truncated fields, reserved
    /// nibbles or a payload marker with no payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(GatewayError::Coap("message shorter than header".into()));
        }
        let version = data[0] >> 6;
        if version != VERSION {
            return Err(GatewayError::Coap(format!("unsupported version {version}")));
        }
        let token_len = (data[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(GatewayError::Coap(format!("invalid token length {token_len}")));
        }
        let message_type = MessageType::from_bits(data[0] >> 4);
        let code = Code::from_byte(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = 4;
        let token = data
            .get(pos..pos + token_len)
            .ok_or_else(|| GatewayError::Coap("truncated token".into()))?
            .to_vec();
        pos += token_len;

        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Vec::new();

        while pos < data.len() {
            let byte = data[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == data.len() {
                    return Err(GatewayError::Coap("payload marker without payload".into()));
                }
                payload = data[pos..].to_vec();
                break;
            }

            let delta = decode_option_field(byte >> 4, data, &mut pos)?;
            let len = decode_option_field(byte & 0x0F, data, &mut pos)?;

            number = u16::try_from(number as usize + delta)
                .map_err(|_| GatewayError::Coap("option number overflow".into()))?;
            let value = data
                .get(pos..pos + len)
                .ok_or_else(|| GatewayError::Coap("truncated option value".into()))?
                .to_vec();
            pos += len;
            options.push(CoapOption { number, value });
        }

        Ok(Self {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

/// Minimal big-endian encoding of an unsigned option value (zero encodes as empty).
fn encode_uint(value: u16) -> Vec<u8> {
    match value {
        0 => Vec::new(),
        1..=0xFF => vec![value as u8],
        _ => value.to_be_bytes().to_vec(),
    }
}

fn encode_option_field(value: usize) -> Result<(u8, Vec<u8>)> {
    match value {
        0..=12 => Ok((value as u8, Vec::new())),
        13..=268 => Ok((13, vec![(value - 13) as u8])),
        269..=65804 => Ok((14, ((value - 269) as u16).to_be_bytes().to_vec())),
        _ => Err(GatewayError::Coap(format!("option field too large: {value}"))),
    }
}

fn decode_option_field(nibble: u8, data: &[u8], pos: &mut usize) -> Result<usize> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let ext = *data
                .get(*pos)
                .ok_or_else(|| GatewayError::Coap("truncated option header".into()))?;
            *pos += 1;
            Ok(ext as usize + 13)
        }
        14 => {
            let ext = data
                .get(*pos..*pos + 2)
                .ok_or_else(|| GatewayError::Coap("truncated option header".into()))?;
            *pos += 2;
            Ok(u16::from_be_bytes([ext[0], ext[1]]) as usize + 269)
        }
        _ => Err(GatewayError::Coap("reserved option nibble".into())),
    }
}
