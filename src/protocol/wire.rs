//! Wire framing
//!
//! Async reads and writes of handshakes and length-prefixed messages.

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::{Message, MAX_MESSAGE_LENGTH};
use crate::error::TorrentError;

pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, handshake: &Handshake) -> Result<()> {
    writer.write_all(&handshake.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).await?;
    Handshake::deserialize(&buf)
}

/// Read one length-prefixed message, rejecting oversized frames
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let length = reader.read_u32().await? as usize;
    if length > MAX_MESSAGE_LENGTH {
        error!("Frame of {} bytes exceeds limit of {}", length, MAX_MESSAGE_LENGTH);
        return Err(TorrentError::protocol_error_with_source(
            "Frame too large",
            format!("{} bytes", length),
        ).into());
    }

    let mut body = BytesMut::zeroed(length);
    reader.read_exact(&mut body).await?;
    trace!("Read frame of {} bytes", length);
    Message::decode(body.freeze())
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_messages_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &Message::Unchoke).await.unwrap();
        write_message(&mut a, &Message::KeepAlive).await.unwrap();
        write_message(&mut a, &Message::Piece { index: 1, begin: 0, block: Bytes::from_static(b"abc") })
            .await
            .unwrap();

        assert_eq!(read_message(&mut b).await.unwrap(), Message::Unchoke);
        assert_eq!(read_message(&mut b).await.unwrap(), Message::KeepAlive);
        assert_eq!(
            read_message(&mut b).await.unwrap(),
            Message::Piece { index: 1, begin: 0, block: Bytes::from_static(b"abc") }
        );
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let sent = Handshake::new([7u8; 20], [9u8; 20]);
        write_handshake(&mut a, &sent).await.unwrap();
        assert_eq!(read_handshake(&mut b).await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_MESSAGE_LENGTH + 1) as u32).await.unwrap();
        assert!(read_message(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10, 7, 0]).await.unwrap();
        drop(a);
        assert!(read_message(&mut b).await.is_err());
    }
}
