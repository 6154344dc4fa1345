//! avaproto - wire protocol for the avalink avatar bridge
//!
//! This library provides:
//! - `value`: tagged argument values (`OscValue`) and declared parameter types
//! - `address`: address safety rules and the avatar/chatbox namespaces
//! - `codec`: message and bundle encode/decode on top of `rosc`
//!
//! Everything that touches bytes lives here; the bridge only sees
//! [`Message`], [`Bundle`] and [`OscValue`].

pub mod address;
pub mod codec;
pub mod value;

pub use address::{
    is_valid_address, parameter_address, parameter_name, parse_physbone_address,
    physbone_address, validate_address, AddressError, PhysBoneSub, AVATAR_CHANGE,
    CHATBOX_INPUT, CHATBOX_TYPING, MAX_ADDRESS_LEN, PARAMETER_PREFIX, PHYSBONE_PREFIX,
};
pub use codec::{
    decode_datagram, encode_bundle, encode_message, Bundle, Decoded, Message, WireError,
    MAX_DATAGRAM,
};
pub use value::{OscValue, ValueType};
