use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Maximum number of payload bytes carried by a classic CAN frame.
pub const MAX_PAYLOAD_LEN: usize = 8;
/// Highest identifier expressible with standard (11-bit) addressing.
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Highest identifier expressible with extended (29-bit) addressing.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Payload has an odd number of hex digits ({0}), data length must be even")]
    OddHexLength(usize),
    #[error("Payload is {0} bytes long, at most 8 bytes are allowed")]
    PayloadTooLong(usize),
    #[error("Invalid hex byte '{0}' in payload")]
    InvalidHex(String),
    #[error("Arbitration id 0x{0:x} does not fit in 29 bits")]
    IdOutOfRange(u32),
    #[error("Malformed frame '{0}', expected ID#DATA")]
    MalformedFrame(String),
    #[error("Bit {bit} is outside the {len}-byte payload")]
    BitOutOfRange { bit: usize, len: usize },
}

/// A single addressed bus frame together with the time to wait after sending it.
///
/// The delay doubles as the observation window: after a frame is replayed the
/// engine watches the sensor for at most this long before moving on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanMessage {
    arb_id: u32,
    data: Vec<u8>,
    delay: Duration,
    is_extended: bool,
    is_error: bool,
    is_remote: bool,
}

impl CanMessage {
    /// Builds a frame. Negative, NaN or infinite delays become zero.
    pub fn new(arb_id: u32, data: Vec<u8>, delay_secs: f64) -> Result<Self, MessageError> {
        Self::with_delay(arb_id, data, clamp_delay(delay_secs))
    }

    pub fn with_delay(arb_id: u32, data: Vec<u8>, delay: Duration) -> Result<Self, MessageError> {
        if arb_id > EXTENDED_ID_MAX {
            return Err(MessageError::IdOutOfRange(arb_id));
        }
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(MessageError::PayloadTooLong(data.len()));
        }
        Ok(Self {
            arb_id,
            data,
            delay,
            is_extended: arb_id > STANDARD_ID_MAX,
            is_error: false,
            is_remote: false,
        })
    }

    /// Parses the candump shorthand `123#c0ffee` (`R` as data marks a remote request).
    /// Identifiers written with more than three digits use extended addressing.
    pub fn parse_frame(text: &str, delay: Duration) -> Result<Self, MessageError> {
        let trimmed = text.trim();
        let (id_text, data_text) = trimmed
            .split_once('#')
            .ok_or_else(|| MessageError::MalformedFrame(trimmed.to_string()))?;
        if id_text.is_empty() {
            return Err(MessageError::MalformedFrame(trimmed.to_string()));
        }
        let arb_id = u32::from_str_radix(id_text, 16)
            .map_err(|_| MessageError::MalformedFrame(trimmed.to_string()))?;
        let remote = data_text.eq_ignore_ascii_case("r");
        let data = if remote {
            Vec::new()
        } else {
            parse_hex_payload(data_text)?
        };
        let message = Self::with_delay(arb_id, data, delay)?
            .with_remote_request(remote);
        Ok(if id_text.len() > 3 {
            message.with_extended(true)
        } else {
            message
        })
    }

    pub fn with_extended(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended || self.arb_id > STANDARD_ID_MAX;
        self
    }

    pub fn with_error_frame(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    pub fn with_remote_request(mut self, is_remote: bool) -> Self {
        self.is_remote = is_remote;
        self
    }

    /// Returns a copy carrying a different payload, keeping id, flags and delay.
    pub fn with_data(&self, data: Vec<u8>) -> Result<Self, MessageError> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(MessageError::PayloadTooLong(data.len()));
        }
        Ok(Self {
            data,
            ..self.clone()
        })
    }

    pub fn arb_id(&self) -> u32 {
        self.arb_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn is_error_frame(&self) -> bool {
        self.is_error
    }

    pub fn is_remote_request(&self) -> bool {
        self.is_remote
    }

    /// MD5 digest over everything that identifies the frame on the wire.
    /// The delay is deliberately left out: two sends of the same frame share a digest.
    pub fn digest(&self) -> [u8; 16] {
        let mut identity = Vec::with_capacity(5 + self.data.len());
        identity.extend_from_slice(&self.arb_id.to_le_bytes());
        identity.push(
            u8::from(self.is_extended) | u8::from(self.is_error) << 1 | u8::from(self.is_remote) << 2,
        );
        identity.extend_from_slice(&self.data);
        md5::compute(&identity).0
    }

    pub fn fingerprint(&self) -> String {
        format!("{:x}", md5::Digest(self.digest()))
    }

    pub fn data_hex(&self) -> String {
        self.data.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X}#", self.arb_id)?;
        } else {
            write!(f, "{:03X}#", self.arb_id)?;
        }
        if self.is_remote {
            f.write_str("R")
        } else {
            f.write_str(&self.data_hex())
        }
    }
}

impl FromStr for CanMessage {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_frame(s, Duration::ZERO)
    }
}

pub fn clamp_delay(delay_secs: f64) -> Duration {
    if delay_secs.is_nan() || delay_secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
}

/// Decodes a hex string such as `c0ffee` into payload bytes.
pub fn parse_hex_payload(text: &str) -> Result<Vec<u8>, MessageError> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(MessageError::OddHexLength(text.len()));
    }
    if text.len() / 2 > MAX_PAYLOAD_LEN {
        return Err(MessageError::PayloadTooLong(text.len() / 2));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            let pair = text
                .get(i..i + 2)
                .ok_or_else(|| MessageError::InvalidHex(text.to_string()))?;
            u8::from_str_radix(pair, 16).map_err(|_| MessageError::InvalidHex(pair.to_string()))
        })
        .collect()
}
