// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Length-prefixed JSON framing: a big-endian `u32` byte count followed by
//! the serialized message.

use crate::core::{CoreError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side accepts. Captured images dominate frame size.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one message and flush.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json_bytes = serde_json::to_vec(msg)?;
    if json_bytes.len() > MAX_FRAME_LEN {
        return Err(CoreError::InvalidConnection(format!(
            "outgoing frame of {} bytes exceeds limit",
            json_bytes.len()
        )));
    }

    let len = json_bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&json_bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CoreError::InvalidConnection(format!(
            "incoming frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await.map_err(|e| {
        CoreError::InvalidConnection(format!("truncated frame ({} bytes expected): {}", len, e))
    })?;

    serde_json::from_slice(&msg_buf)
        .map(Some)
        .map_err(|e| CoreError::InvalidConnection(format!("undecodable frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::protocol::{CoreCommand, HostMessage};

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        for id in 0..3u64 {
            write_frame(
                &mut a,
                &HostMessage::Request {
                    id,
                    command: CoreCommand::Reset,
                },
            )
            .await
            .unwrap();
        }
        drop(a);

        for expected in 0..3u64 {
            let msg: HostMessage = read_frame(&mut b).await.unwrap().unwrap();
            assert!(matches!(msg, HostMessage::Request { id, .. } if id == expected));
        }
        let end: Option<HostMessage> = read_frame(&mut b).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame::<_, HostMessage>(&mut b).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_connection_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{\"ty").await.unwrap();
        drop(a);
        let err = read_frame::<_, HostMessage>(&mut b).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_garbage_payload_is_connection_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        let err = read_frame::<_, HostMessage>(&mut b).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
