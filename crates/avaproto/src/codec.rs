//! Message and bundle encoding on top of `rosc`.
//!
//! ## Wire Format
//!
//! Standard OSC 1.0 over UDP, one packet per datagram:
//!
//! ```text
//! message: <address, padded> <",tags", padded> <args...>
//! bundle:  "#bundle\0" <timetag u64> (<size i32> <message>)*
//! ```
//!
//! Bundles carry a logical timetag from a monotonic counter rather than an NTP
//! time; the remote application applies bundle contents immediately either way.

use rosc::{OscBundle, OscMessage, OscPacket, OscTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{validate_address, AddressError};
use crate::value::OscValue;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("failed to encode packet: {0}")]
    Encode(String),

    #[error("failed to decode datagram: {0}")]
    Decode(String),

    #[error("unsupported argument on {address}: {kind}")]
    UnsupportedArgument { address: String, kind: String },

    #[error("bundle is empty")]
    EmptyBundle,
}

/// One address plus its typed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub address: String,
    pub args: Vec<OscValue>,
}

impl Message {
    pub fn new(address: impl Into<String>, args: Vec<OscValue>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// A message with exactly one argument, the usual shape for parameters.
    pub fn single(address: impl Into<String>, value: impl Into<OscValue>) -> Self {
        Self::new(address, vec![value.into()])
    }

    pub fn first(&self) -> Option<&OscValue> {
        self.args.first()
    }

    fn to_packet(&self) -> Result<OscPacket, WireError> {
        validate_address(&self.address)?;
        Ok(OscPacket::Message(OscMessage {
            addr: self.address.clone(),
            args: self.args.iter().map(OscValue::to_osc).collect(),
        }))
    }
}

/// Messages flushed together under one logical timetag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub timetag: u64,
    pub messages: Vec<Message>,
}

impl Bundle {
    pub fn new(timetag: u64, messages: Vec<Message>) -> Self {
        Self { timetag, messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Result of decoding one datagram: its messages, flattened out of any
/// (nested) bundles in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decoded {
    /// Timetag of the outermost bundle, if the datagram was a bundle.
    pub timetag: Option<u64>,
    pub messages: Vec<Message>,
    /// Messages dropped because an argument had an unsupported type.
    pub skipped: usize,
}

fn to_osc_time(timetag: u64) -> OscTime {
    OscTime {
        seconds: (timetag >> 32) as u32,
        fractional: timetag as u32,
    }
}

fn from_osc_time(time: OscTime) -> u64 {
    (u64::from(time.seconds) << 32) | u64::from(time.fractional)
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    let packet = message.to_packet()?;
    rosc::encoder::encode(&packet).map_err(|e| WireError::Encode(format!("{:?}", e)))
}

/// Encode every message into one bundle. Any invalid address fails the whole
/// bundle; callers validate before queueing.
pub fn encode_bundle(bundle: &Bundle) -> Result<Vec<u8>, WireError> {
    if bundle.is_empty() {
        return Err(WireError::EmptyBundle);
    }
    let content = bundle
        .messages
        .iter()
        .map(Message::to_packet)
        .collect::<Result<Vec<_>, _>>()?;

    let packet = OscPacket::Bundle(OscBundle {
        timetag: to_osc_time(bundle.timetag),
        content,
    });
    rosc::encoder::encode(&packet).map_err(|e| WireError::Encode(format!("{:?}", e)))
}

/// Decode one UDP datagram.
pub fn decode_datagram(bytes: &[u8]) -> Result<Decoded, WireError> {
    let (_rest, packet) =
        rosc::decoder::decode_udp(bytes).map_err(|e| WireError::Decode(format!("{:?}", e)))?;

    let mut decoded = Decoded::default();
    if let OscPacket::Bundle(ref bundle) = packet {
        decoded.timetag = Some(from_osc_time(bundle.timetag));
    }
    flatten(packet, &mut decoded);
    Ok(decoded)
}

fn flatten(packet: OscPacket, out: &mut Decoded) {
    match packet {
        OscPacket::Message(msg) => {
            let address = msg.addr;
            let args = msg
                .args
                .into_iter()
                .map(|arg| OscValue::from_osc(&address, arg))
                .collect::<Result<Vec<_>, _>>();
            match args {
                Ok(args) => out.messages.push(Message { address, args }),
                Err(_) => out.skipped += 1,
            }
        }
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten(inner, out);
            }
        }
    }
}
