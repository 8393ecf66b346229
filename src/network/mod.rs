//! Network Module
//!
//! Framed TCP communication between endpoints. Every message travels as an
//! 8-byte frame header followed by its bincode body; the header carries the
//! body length and a crc32 the receiver checks before decoding.

mod client;
mod server;

pub use client::NetworkClient;
pub use server::{NetworkServer, NetworkServerHandle, RequestHandler};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::protocol::{FrameHeader, Message};

/// Receive one framed message
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut prefix = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut prefix).await?;
    let header = FrameHeader::from_bytes(&prefix);

    let mut frame = vec![0u8; header.length as usize];
    reader.read_exact(&mut frame).await?;
    header.verify(&frame)?;

    Ok(Message::deserialize(&frame)?)
}

/// Send one framed message
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = message.serialize()?;

    // Header and body go out in a single write.
    let mut wire = Vec::with_capacity(FrameHeader::SIZE + frame.len());
    wire.extend_from_slice(&FrameHeader::new(&frame).to_bytes());
    wire.extend_from_slice(&frame);

    writer.write_all(&wire).await?;
    writer.flush().await?;

    Ok(())
}
