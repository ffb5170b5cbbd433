//! BitTorrent protocol module
//!
//! Handshake, message encoding and async framing for the peer wire protocol.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, HANDSHAKE_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId, MAX_MESSAGE_LENGTH};
pub use wire::{read_handshake, read_message, write_handshake, write_message};
