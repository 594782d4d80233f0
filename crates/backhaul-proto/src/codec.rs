//! Codec for the control stream handshake

use crate::messages::Auth;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed handshake payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake payload exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Stream ended before a complete handshake payload arrived")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON codec for [`Auth`].
///
/// The payload has no length prefix: the stream framing delimits it, and the
/// decoder stops as soon as one complete object has been parsed.
pub struct AuthCodec;

impl AuthCodec {
    /// Largest handshake payload accepted from a peer
    pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

    /// Encode a handshake payload
    pub fn encode(auth: &Auth) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(auth)?))
    }

    /// Decode a handshake payload from buffered bytes
    ///
    /// Returns Ok(Some(auth)) once a complete object is buffered and removes
    /// it from `buf`, Ok(None) if more data is needed, Err on malformed input.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Auth>, CodecError> {
        let mut objects = serde_json::Deserializer::from_slice(buf).into_iter::<Auth>();

        match objects.next() {
            Some(Ok(auth)) => {
                let consumed = objects.byte_offset();
                buf.advance(consumed);
                Ok(Some(auth))
            }
            Some(Err(e)) if e.is_eof() => Self::need_more(buf),
            Some(Err(e)) => Err(CodecError::Json(e)),
            None => Self::need_more(buf),
        }
    }

    fn need_more(buf: &BytesMut) -> Result<Option<Auth>, CodecError> {
        if buf.len() >= Self::MAX_PAYLOAD_SIZE {
            return Err(CodecError::TooLarge(Self::MAX_PAYLOAD_SIZE));
        }
        Ok(None)
    }
}

/// Read exactly one handshake payload from `reader`.
///
/// Does not wait for EOF; bytes after the object stay unread in the
/// internal buffer and are discarded.
pub async fn read_auth<R>(reader: &mut R) -> Result<Auth, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(512);

    loop {
        if let Some(auth) = AuthCodec::decode(&mut buf)? {
            trace!(domain = %auth.domain, "Decoded handshake payload");
            return Ok(auth);
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(CodecError::UnexpectedEof);
        }
    }
}

/// Write one handshake payload to `writer` and flush it.
pub async fn write_auth<W>(writer: &mut W, auth: &Auth) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = AuthCodec::encode(auth)?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_needs_more_data() {
        let mut buf = BytesMut::from(&br#"{"token":"abc","dom"#[..]);
        assert!(AuthCodec::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#"ain":"example.com"}"#);
        let auth = AuthCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(auth, Auth::new("abc", "example.com"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut buf = BytesMut::from(&br#"{"token":"t","domain":"d"}GET / HTTP/1.1"#[..]);
        let auth = AuthCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(auth.domain, "d");
        assert_eq!(&buf[..], b"GET / HTTP/1.1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut buf = BytesMut::from(&b"not json at all"[..]);
        assert!(matches!(
            AuthCodec::decode(&mut buf),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let mut buf = BytesMut::from(&br#"{"token": 42, "domain": "d"}"#[..]);
        assert!(AuthCodec::decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_enforces_size_limit() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(br#"{"token":""#);
        buf.extend_from_slice(&vec![b'a'; AuthCodec::MAX_PAYLOAD_SIZE]);
        assert!(matches!(
            AuthCodec::decode(&mut buf),
            Err(CodecError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_read_auth_over_split_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            client.write_all(br#"{"token":"orcas","#).await.unwrap();
            tokio::task::yield_now().await;
            client
                .write_all(br#""domain":"cetacean.club"}"#)
                .await
                .unwrap();
            // Keep the stream open: the reader must not need EOF
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            drop(client);
        });

        let auth = read_auth(&mut server).await.unwrap();
        assert_eq!(auth, Auth::new("orcas", "cetacean.club"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_auth_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(br#"{"token":"orc"#).await.unwrap();
        drop(client);

        assert!(matches!(
            read_auth(&mut server).await,
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let auth = Auth::new("token", "example.com");

        write_auth(&mut client, &auth).await.unwrap();
        assert_eq!(read_auth(&mut server).await.unwrap(), auth);
    }
}
