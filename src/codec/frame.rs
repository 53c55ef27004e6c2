//! Record definitions for the tunnel protocol
//!
//! This module defines the typed records exchanged between peers and the
//! JSON control-message envelope they carry.
//!
//! # Datagram record format
//! ```text
//! +--------+--------+--------+------------------+
//! |  Type  |   Length (2B, BE) |  Payload ...   |
//! +--------+--------+--------+------------------+
//! ```
//!
//! - Type: record type identifier (1 byte)
//! - Length + payload: present only for CONTROL and PACKET records;
//!   RESET and KEEPALIVE are single-byte records
//!
//! The 4-byte magic word 0x01306A15 is exchanged once, before a link
//! exists, and is the only untyped traffic on the wire.

pub use crate::codec::errors::FrameError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Display;

/// Protocol magic word, sent in network byte order during the handshake
pub const MAGIC_WORD: u32 = 0x01306A15;

/// Ceiling on a reassembled stream frame; derived from the tun read buffer
pub const MAX_RECORD: usize = 2048;

/// Record type identifiers
///
/// - Reset: ask the peer to abandon the link immediately
/// - Control: JSON control message (address negotiation and addon traffic)
/// - Packet: tunneled raw IP packet
/// - KeepAlive: datagram liveness probe
pub(crate) enum RecordType {
    Reset = 0x00,
    Control = 0x01,
    Packet = 0x02,
    KeepAlive = 0x03,
}

impl TryFrom<u8> for RecordType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(RecordType::Reset),
            0x01 => Ok(RecordType::Control),
            0x02 => Ok(RecordType::Packet),
            0x03 => Ok(RecordType::KeepAlive),
            _ => Err(FrameError::UnknownType(v)),
        }
    }
}

/// A decoded protocol record
#[derive(Debug, Clone)]
pub enum Record {
    Reset,
    KeepAlive,
    Control(ControlMessage),
    Packet(Vec<u8>),
}

impl Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Record::Reset => write!(f, "reset"),
            Record::KeepAlive => write!(f, "keep-alive"),
            Record::Control(msg) => write!(f, "control message {}", msg.msg_type()),
            Record::Packet(payload) => write!(f, "packet of {} bytes", payload.len()),
        }
    }
}

/// A JSON control message
///
/// Always an object with a required string `type` field. The three
/// negotiation messages are built through the constructors below; addons
/// may define further types and register for them on the session.
#[derive(Debug, Clone)]
pub struct ControlMessage(Value);

pub const IP_REQUEST: &str = "ip_request";
pub const IP_REPLY: &str = "ip_reply";
pub const IP_CONFIRM: &str = "ip_confirm";

impl ControlMessage {
    /// Wraps a raw JSON value, requiring an object with a string `type`
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        match value.get("type").and_then(Value::as_str) {
            Some(_) => Ok(ControlMessage(value)),
            None => Err(FrameError::Invalid),
        }
    }

    pub fn ip_request() -> Self {
        ControlMessage(json!({ "type": IP_REQUEST }))
    }

    pub fn ip_reply(reply: &IpReply) -> Self {
        ControlMessage(json!({
            "type": IP_REPLY,
            "server_ip": reply.server_ip,
            "client_ip": reply.client_ip,
            "network": reply.network,
        }))
    }

    pub fn ip_confirm() -> Self {
        ControlMessage(json!({ "type": IP_CONFIRM }))
    }

    pub fn msg_type(&self) -> &str {
        // from_value and the constructors guarantee the field exists
        self.0.get("type").and_then(Value::as_str).unwrap_or("")
    }

    /// Deserializes the message body into a typed struct
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

impl Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body of the server's address assignment reply
///
/// All fields are strings on the wire: dotted IPv4 for the two overlay
/// addresses, CIDR notation for the overlay network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpReply {
    /// Overlay address installed on the server side of the tunnel
    pub server_ip: String,
    /// Overlay address assigned to the requesting client
    pub client_ip: String,
    /// The overlay network both addresses were drawn from
    pub network: String,
}
