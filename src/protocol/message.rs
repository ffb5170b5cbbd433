//! BitTorrent protocol messages
//!
//! Peer wire messages and their length-prefixed encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use anyhow::Result;
use tracing::{error, trace};

use crate::error::TorrentError;

/// Largest frame accepted from a peer: a 1 MiB block plus the piece header
pub const MAX_MESSAGE_LENGTH: usize = (1 << 20) + 13;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            _ => {
                error!("Invalid message ID: {}", value);
                return Err(TorrentError::protocol_error_with_source(
                    "Invalid message ID",
                    format!("value: {}", value),
                ).into());
            }
        })
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive => None,
        }
    }

    /// Frame length, excluding the 4-byte prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Encode with the length prefix
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }

        trace!("Serialized {:?}: {} bytes", self.message_id(), buf.len());
        buf.freeze()
    }

    /// Decode a frame body (id byte plus payload, no length prefix).
    ///
    /// An empty body is a keepalive.
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(body.get_u8())?;
        let need = |n: usize, body: &Bytes| -> Result<()> {
            if body.remaining() < n {
                error!("{:?} message too short: expected {} bytes, got {}", message_id, n, body.remaining());
                return Err(TorrentError::protocol_error_with_source(
                    format!("{:?} message too short", message_id),
                    format!("expected {} bytes, got {}", n, body.remaining()),
                ).into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(4, &body)?;
                Message::Have { piece_index: body.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: body },
            MessageId::Request | MessageId::Cancel => {
                need(12, &body)?;
                let index = body.get_u32();
                let begin = body.get_u32();
                let length = body.get_u32();
                if message_id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                need(8, &body)?;
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece { index, begin, block: body }
            }
            MessageId::Port => {
                need(2, &body)?;
                Message::Port { listen_port: body.get_u16() }
            }
        };
        trace!("Decoded {:?}", message.message_id());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(frame: &Bytes) -> Bytes {
        frame.slice(4..)
    }

    #[test]
    fn test_keepalive_encoding() {
        let frame = Message::KeepAlive.serialize();
        assert_eq!(&frame[..], &[0, 0, 0, 0]);
        assert_eq!(Message::decode(body(&frame)).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_layout() {
        let frame = Message::Request { index: 1, begin: 16384, length: 16384 }.serialize();
        assert_eq!(
            &frame[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_have_uses_full_index() {
        let frame = Message::Have { piece_index: 0x0102_0304 }.serialize();
        match Message::decode(body(&frame)).unwrap() {
            Message::Have { piece_index } => assert_eq!(piece_index, 0x0102_0304),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_piece_decode() {
        let message = Message::Piece { index: 10, begin: 32, block: Bytes::from_static(&[1, 2, 3, 4, 5]) };
        let frame = message.serialize();
        assert_eq!(frame.len(), 4 + 9 + 5);
        assert_eq!(Message::decode(body(&frame)).unwrap(), message);
    }

    #[test]
    fn test_truncated_payloads_rejected() {
        assert!(Message::decode(Bytes::from_static(&[4, 0, 0])).is_err());
        assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 1])).is_err());
        assert!(Message::decode(Bytes::from_static(&[7, 0, 0, 0])).is_err());
        assert!(Message::decode(Bytes::from_static(&[9, 1])).is_err());
    }

    #[test]
    fn test_unknown_id_rejected() {
        assert!(Message::decode(Bytes::from_static(&[20])).is_err());
        assert!(MessageId::try_from(10).is_err());
        assert_eq!(MessageId::try_from(7).unwrap(), MessageId::Piece);
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Bitfield { bitfield: Bytes::from_static(&[0xff, 0x80]) }.length(), 3);
        assert_eq!(Message::Cancel { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Port { listen_port: 0 }.length(), 3);
    }
}
