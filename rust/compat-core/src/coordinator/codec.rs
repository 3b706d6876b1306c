//! Length-prefixed JSON framing for the control channel.
//!
//! A frame is a 4-byte big-endian payload length followed by the JSON
//! encoding of one [`Message`].

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::Message;
use crate::error::{CompatError, Result};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub fn encode(msg: &Message) -> Result<BytesMut> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| CompatError::serialization(format!("encode {}: {}", msg.kind(), e)))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CompatError::protocol(format!(
            "{} frame of {} bytes exceeds limit of {}",
            msg.kind(),
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf)
}

pub fn decode(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload)
        .map_err(|e| CompatError::protocol(format!("malformed message: {}", e)))
}

pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next message. `Ok(None)` means the peer closed the
    /// connection cleanly between frames.
    ///
    /// Not cancellation safe: dropping the future mid-frame loses sync.
    pub async fn read(&mut self) -> Result<Option<Message>> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(CompatError::transport_with_source("read frame length", e)),
        };
        if len > MAX_FRAME_LEN {
            return Err(CompatError::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }
        let mut payload = BytesMut::zeroed(len);
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| CompatError::transport_with_source("read frame payload", e))?;
        decode(&payload).map(Some)
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = encode(msg)?;
        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| CompatError::transport_with_source(format!("send {}", msg.kind()), e))?;
        self.inner
            .flush()
            .await
            .map_err(|e| CompatError::transport_with_source("flush", e))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefix() {
        let frame = encode(&Message::Shutdown).unwrap();
        let payload = br#"{"type":"shutdown"}"#;
        assert_eq!(&frame[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..], payload);
    }

    #[tokio::test]
    async fn test_stream_roundtrip_and_clean_eof() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send(&Message::CheckBandwidthTool).await.unwrap();
        writer
            .send(&Message::Abort {
                reason: "operator cancelled".to_string(),
            })
            .await
            .unwrap();
        drop(writer);

        assert_eq!(reader.read().await.unwrap(), Some(Message::CheckBandwidthTool));
        assert_eq!(
            reader.read().await.unwrap(),
            Some(Message::Abort {
                reason: "operator cancelled".to_string()
            })
        );
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, CompatError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        let payload = br#"{"type":"nope"}"#;
        client.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
        client.write_all(payload).await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_transport_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{\"ty").await.unwrap();
        drop(client);
        let err = reader.read().await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
