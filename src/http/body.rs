use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// spec.md §3 "Body repeatability": bodies at or under this size are
/// fully buffered and safe to replay; anything larger streams once.
pub const MAX_BUFFERED_BODY: usize = 100 * 1024;

/// Wraps a still-buffered client input as a body suitable for upstream
/// replay (spec.md §4.3). `getContent()` is intentionally not exposed
/// — the upstream library this models consumes bodies by push, so
/// `write_to` is the only way data leaves this type.
pub struct StreamingRequestBody {
    prefix: Vec<u8>,
    repeatable: bool,
    content_length: i64,
    remaining: Option<Box<dyn AsyncRead + Unpin + Send>>,
}

impl StreamingRequestBody {
    /// `reader` must be positioned at the start of the body.
    /// `content_length` is the declared length (`-1` if absent or
    /// Transfer-Encoding: chunked).
    pub async fn new<R>(mut reader: R, content_length: i64) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if content_length >= 0 && (content_length as usize) <= MAX_BUFFERED_BODY {
            let mut buf = vec![0u8; content_length as usize];
            reader.read_exact(&mut buf).await?;
            return Ok(StreamingRequestBody {
                prefix: buf,
                repeatable: true,
                content_length,
                remaining: None,
            });
        }

        if content_length >= 0 {
            // Larger than the buffering cap: never pre-buffered, never
            // repeatable, length surfaced unchanged.
            return Ok(StreamingRequestBody {
                prefix: Vec::new(),
                repeatable: false,
                content_length,
                remaining: Some(Box::new(reader)),
            });
        }

        // Unknown length: buffer up to the cap, then peek one more
        // byte to see whether the stream has anything left.
        let mut buf = Vec::with_capacity(MAX_BUFFERED_BODY);
        {
            let mut limited = (&mut reader).take(MAX_BUFFERED_BODY as u64);
            tokio::io::copy(&mut limited, &mut buf).await?;
        }

        let mut probe = [0u8; 1];
        let n = reader.read(&mut probe).await?;
        if n == 0 {
            // Exactly EOF after buffering: the whole body fit, safe to replay.
            Ok(StreamingRequestBody {
                prefix: buf,
                repeatable: true,
                content_length,
                remaining: None,
            })
        } else {
            // More data remains beyond the cap: re-prepend the probed
            // byte ahead of the rest of the stream and stream it once.
            let peeked = std::io::Cursor::new(vec![probe[0]]);
            let chained = peeked.chain(reader);
            Ok(StreamingRequestBody {
                prefix: buf,
                repeatable: false,
                content_length,
                remaining: Some(Box::new(chained)),
            })
        }
    }

    pub fn repeatable(&self) -> bool {
        self.repeatable
    }

    /// The declared content length, unchanged regardless of buffering
    /// decisions (spec.md §3: "content length surfaced unchanged").
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// Writes the pre-buffered prefix, then (for non-repeatable
    /// bodies) streams the rest — up to `content_length - prefix.len()`
    /// more bytes, or until EOF when the length is unknown. Failure
    /// during write propagates as `UpstreamIOError` (spec.md §4.3).
    pub async fn write_to<W: AsyncWrite + Unpin>(&mut self, out: &mut W) -> Result<(), ProxyError> {
        out.write_all(&self.prefix).await.map_err(ProxyError::UpstreamIo)?;
        if let Some(mut source) = self.remaining.take() {
            if self.content_length >= 0 {
                let remaining_len = self.content_length as u64 - self.prefix.len() as u64;
                let mut limited = source.take(remaining_len);
                tokio::io::copy(&mut limited, out).await.map_err(ProxyError::UpstreamIo)?;
            } else {
                tokio::io::copy(&mut source, out).await.map_err(ProxyError::UpstreamIo)?;
            }
        }
        out.flush().await.map_err(ProxyError::UpstreamIo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn small_known_length_is_fully_buffered_and_repeatable() {
        let data = b"hello proxy".to_vec();
        let mut body = StreamingRequestBody::new(Cursor::new(data.clone()), data.len() as i64)
            .await
            .unwrap();
        assert!(body.repeatable());

        let mut out1 = Vec::new();
        body.write_to(&mut out1).await.unwrap();
        assert_eq!(out1, data);

        let mut out2 = Vec::new();
        body.write_to(&mut out2).await.unwrap();
        assert_eq!(out2, data, "second write_to must emit identical output");
    }

    #[tokio::test]
    async fn oversized_known_length_is_not_repeatable() {
        let len = MAX_BUFFERED_BODY + 1;
        let data = vec![b'x'; len];
        let body = StreamingRequestBody::new(Cursor::new(data), len as i64).await.unwrap();
        assert!(!body.repeatable());
        assert_eq!(body.content_length(), len as i64);
    }

    #[tokio::test]
    async fn oversized_body_streams_exact_byte_count() {
        let len = MAX_BUFFERED_BODY + 500;
        let data = vec![b'y'; len];
        let mut body = StreamingRequestBody::new(Cursor::new(data.clone()), len as i64)
            .await
            .unwrap();
        let mut out = Vec::new();
        body.write_to(&mut out).await.unwrap();
        assert_eq!(out.len(), len);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn unknown_length_fitting_in_cap_is_repeatable() {
        let data = b"short unknown-length body".to_vec();
        let mut body = StreamingRequestBody::new(Cursor::new(data.clone()), -1).await.unwrap();
        assert!(body.repeatable());
        let mut out = Vec::new();
        body.write_to(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn unknown_length_exceeding_cap_is_not_repeatable_but_streams_fully() {
        let len = MAX_BUFFERED_BODY + 123;
        let data = vec![b'z'; len];
        let mut body = StreamingRequestBody::new(Cursor::new(data.clone()), -1).await.unwrap();
        assert!(!body.repeatable());
        let mut out = Vec::new();
        body.write_to(&mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
