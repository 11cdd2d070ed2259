// src/proxy/envelope.rs
//! Control envelopes sharing the TCP port with forwarded payload.
//!
//! In the default [`ControlFraming::Sniff`] mode a single read is assumed to
//! hold exactly one JSON envelope `{"type": <int>, "content": <base64>}`.
//! Bytes that do not decode to a known envelope are not an error: they are
//! the first chunk of a forwarded stream. A heartbeat split across reads, or
//! payload that happens to look like an envelope, is misclassified.
//!
//! [`ControlFraming::Prefixed`] tags envelopes with [`FRAME_MAGIC`] and a
//! big-endian length so that only an exact, complete frame is treated as
//! control traffic.

pub use crate::config::ControlFraming;

use serde::{Deserialize, Serialize};

pub const FRAME_MAGIC: &[u8; 4] = b"TLB1";
const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Failed to encode control envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode alive list: {0}")]
    DecodeList(#[source] serde_json::Error),

    #[error("Control envelope of {0} bytes does not fit a frame")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Heartbeat = 1,
    ListAlive = 2,
    StopListening = 3,
}

impl ControlKind {
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            1 => Some(ControlKind::Heartbeat),
            2 => Some(ControlKind::ListAlive),
            3 => Some(ControlKind::StopListening),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlKind::Heartbeat => "heartbeat",
            ControlKind::ListAlive => "list_alive",
            ControlKind::StopListening => "stop_listening",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// A backend announcing its `host:port`.
    Heartbeat(String),
    ListAlive,
    StopListening,
}

impl ControlMessage {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Heartbeat(_) => ControlKind::Heartbeat,
            ControlMessage::ListAlive => ControlKind::ListAlive,
            ControlMessage::StopListening => ControlKind::StopListening,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type", default)]
    kind: i64,
    #[serde(default, with = "base64_content")]
    content: Vec<u8>,
}

mod base64_content {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if bytes.is_empty() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&STANDARD.encode(bytes))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    framing: ControlFraming,
}

impl EnvelopeCodec {
    pub fn new(framing: ControlFraming) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> ControlFraming {
        self.framing
    }

    /// Classify one read. `None` means the bytes are payload to forward.
    pub fn decode(&self, bytes: &[u8]) -> Option<ControlMessage> {
        let body = match self.framing {
            ControlFraming::Sniff => bytes,
            ControlFraming::Prefixed => unframe(bytes)?,
        };

        let envelope: WireEnvelope = serde_json::from_slice(body).ok()?;

        match ControlKind::from_wire(envelope.kind)? {
            ControlKind::Heartbeat => String::from_utf8(envelope.content)
                .ok()
                .map(ControlMessage::Heartbeat),
            ControlKind::ListAlive => Some(ControlMessage::ListAlive),
            ControlKind::StopListening => Some(ControlMessage::StopListening),
        }
    }

    pub fn encode(&self, message: &ControlMessage) -> Result<Vec<u8>, EnvelopeError> {
        let envelope = WireEnvelope {
            kind: message.kind() as i64,
            content: match message {
                ControlMessage::Heartbeat(address) => address.as_bytes().to_vec(),
                _ => Vec::new(),
            },
        };
        let body = serde_json::to_vec(&envelope).map_err(EnvelopeError::Encode)?;

        match self.framing {
            ControlFraming::Sniff => Ok(body),
            ControlFraming::Prefixed => frame(body),
        }
    }
}

fn frame(body: Vec<u8>) -> Result<Vec<u8>, EnvelopeError> {
    let len = u32::try_from(body.len()).map_err(|_| EnvelopeError::TooLarge(body.len()))?;

    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    framed.extend_from_slice(FRAME_MAGIC);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

fn unframe(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < FRAME_HEADER_LEN || &bytes[..4] != FRAME_MAGIC {
        return None;
    }

    let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let body = &bytes[FRAME_HEADER_LEN..];
    (body.len() == len).then_some(body)
}

/// Reply body for a list query: the bare JSON array, no envelope.
pub fn encode_address_list(addresses: &[String]) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(addresses).map_err(EnvelopeError::Encode)
}

pub fn decode_address_list(bytes: &[u8]) -> Result<Vec<String>, EnvelopeError> {
    serde_json::from_slice(bytes).map_err(EnvelopeError::DecodeList)
}
