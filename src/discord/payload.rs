use std::env::consts::OS;
use std::io::Read;

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tokio_tungstenite::tungstenite::Message;

use crate::error::FrameDecodeError;

/// Upper bound on an inflated binary frame.
pub const MAX_INFLATED_LEN: usize = 10 * 1024 * 1024;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Members above this size are not sent in the initial guild payload.
const LARGE_THRESHOLD: u16 = 250;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize_repr, Serialize_repr)]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    StatusUpdate,
    VoiceStateUpdate,
    VoiceServerPing,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatACK,
}

impl Opcode {
    const ALL: [Opcode; 12] = [
        Opcode::Dispatch,
        Opcode::Heartbeat,
        Opcode::Identify,
        Opcode::StatusUpdate,
        Opcode::VoiceStateUpdate,
        Opcode::VoiceServerPing,
        Opcode::Resume,
        Opcode::Reconnect,
        Opcode::RequestGuildMembers,
        Opcode::InvalidSession,
        Opcode::Hello,
        Opcode::HeartbeatACK,
    ];

    pub fn from_integer(value: i64) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }
}

/// Resolves a raw `op` value to an [`Opcode`].
///
/// Accepts integers, numeric strings and floats (truncated toward zero, the
/// way an integer conversion would). Anything else, or anything outside
/// `0..=11`, is `None`.
pub fn parse_opcode(value: &Value) -> Option<Opcode> {
    let integer = match value {
        Value::Number(number) => match number.as_i64() {
            Some(integer) => integer,
            None => {
                let float = number.as_f64()?;
                if !float.is_finite() {
                    return None;
                }
                let truncated = float.trunc();
                if truncated < i64::MIN as f64 || truncated > i64::MAX as f64 {
                    return None;
                }
                truncated as i64
            }
        },
        Value::String(text) => text.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Opcode::from_integer(integer)
}

/// A decoded inbound gateway frame.
///
/// `op` is kept raw so an unknown opcode is a dropped frame rather than a
/// decode failure.
#[derive(Debug, PartialEq, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub op: Value,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<Box<str>>,
}

impl Frame {
    pub fn opcode(&self) -> Option<Opcode> {
        parse_opcode(&self.op)
    }
}

/// An outbound gateway frame.
#[derive(Debug, Serialize)]
pub struct Payload {
    pub op: Opcode,
    pub d: Value,
}

impl Payload {
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Payload {
            op: Opcode::Heartbeat,
            d: json!(sequence),
        }
    }

    pub fn identify(token: &str) -> Self {
        Payload {
            op: Opcode::Identify,
            d: json!({
                "token": token,
                "properties": {
                    "$os": OS,
                    "$browser": PKG_NAME,
                    "$device": PKG_NAME,
                },
                "compress": true,
                "large_threshold": LARGE_THRESHOLD,
            }),
        }
    }
}

/// Decodes a websocket message into a [`Frame`].
///
/// Binary messages are zlib streams. Control messages (ping, pong, close)
/// carry no frame and yield `Ok(None)`.
pub fn decode(message: Message) -> Result<Option<Frame>, FrameDecodeError> {
    let text = match message {
        Message::Text(text) => text,
        Message::Binary(bytes) => inflate(&bytes)?,
        _ => return Ok(None),
    };
    Ok(Some(serde_json::from_str(&text)?))
}

fn inflate(bytes: &[u8]) -> Result<String, FrameDecodeError> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_INFLATED_LEN as u64 + 1)
        .read_to_end(&mut inflated)?;
    if inflated.len() > MAX_INFLATED_LEN {
        return Err(FrameDecodeError::TooLarge(MAX_INFLATED_LEN));
    }
    Ok(String::from_utf8(inflated)?)
}
