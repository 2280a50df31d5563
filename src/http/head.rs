use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Headers longer than this are rejected with `MalformedRequest`
/// (spec.md §4.2 suggests 64 KiB).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

pub type HeaderList = Vec<(String, String)>;

/// spec.md §3 `RequestHead`: method, request-target, protocol version,
/// an ordered header list that preserves original case for
/// reproduction.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: HeaderList,
}

/// Status-line counterpart, used for both the upstream proxy's CONNECT
/// responses (§4.4) and its responses to relayed requests (§4.5).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content-Length parsed as a non-negative integer, or `-1` when
    /// absent or malformed (spec.md §3). Transfer-Encoding: chunked is
    /// recognized but treated as "unknown length" for the core, same
    /// as an absent Content-Length.
    pub fn content_length(&self) -> i64 {
        if self.is_chunked() {
            return -1;
        }
        match self.header("content-length") {
            Some(v) => v.trim().parse::<i64>().ok().filter(|n| *n >= 0).unwrap_or(-1),
            None => -1,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> i64 {
        match self.header("content-length") {
            Some(v) => v.trim().parse::<i64>().ok().filter(|n| *n >= 0).unwrap_or(-1),
            None => -1,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) => v.to_ascii_lowercase().contains("keep-alive"),
            // HTTP/1.1 defaults to persistent connections absent an
            // explicit `Connection: close`.
            None => true,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Reads CRLF-delimited lines up to the first empty line, enforcing
/// `MAX_HEAD_BYTES` total. Returns the raw lines (start line first,
/// then each header line), with trailing CR/LF stripped.
async fn read_head_lines<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<String>, ProxyError> {
    let mut lines = Vec::new();
    let mut total = 0usize;
    loop {
        let mut raw = Vec::new();
        let n = reader
            .read_until(b'\n', &mut raw)
            .await
            .map_err(ProxyError::UpstreamIo)?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "connection closed before request head completed".into(),
            ));
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(ProxyError::MalformedRequest(format!(
                "request head exceeds {MAX_HEAD_BYTES} bytes"
            )));
        }
        while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8(raw)
            .map_err(|_| ProxyError::MalformedRequest("request head is not valid UTF-8".into()))?;
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    Ok(lines)
}

fn parse_headers(lines: &[String]) -> Result<HeaderList, ProxyError> {
    lines
        .iter()
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::MalformedRequest(format!("malformed header line: {line:?}")))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Reads a request line and header block from a byte stream up to the
/// first empty CRLF line (spec.md §4.2).
pub async fn parse_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RequestHead, ProxyError> {
    let lines = read_head_lines(reader).await?;
    if lines.is_empty() {
        return Err(ProxyError::MalformedRequest("empty request head".into()));
    }
    let request_line = &lines[0];
    let mut parts = request_line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::MalformedRequest(format!("malformed request line: {request_line:?}")))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::MalformedRequest(format!("malformed request line: {request_line:?}")))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::MalformedRequest(format!("malformed request line: {request_line:?}")))?
        .to_string();
    let headers = parse_headers(&lines[1..])?;
    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Reads a status line and header block (CONNECT / relay responses).
pub async fn parse_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ResponseHead, ProxyError> {
    let lines = read_head_lines(reader).await?;
    if lines.is_empty() {
        return Err(ProxyError::UpstreamProtocol("empty response head".into()));
    }
    let status_line = &lines[0];
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::UpstreamProtocol(format!("malformed status line: {status_line:?}")))?
        .to_string();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::UpstreamProtocol(format!("malformed status line: {status_line:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    let headers = parse_headers(&lines[1..])?;
    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

/// Reads and returns an entity body: by `Content-Length` when known, or
/// by de-chunking when `Transfer-Encoding: chunked` is declared,
/// otherwise nothing. Used to drain an intermediate NTLM challenge
/// response before retrying (spec.md §4.4 step (d), §4.5) and to
/// capture a terminal non-2xx response's body for diagnostics. A plain
/// `Content-Length` drain is the common case for a challenge response;
/// chunked framing is handled too since nothing in the wire protocol
/// rules it out.
pub async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, response: &ResponseHead) -> std::io::Result<Vec<u8>> {
    if response.is_chunked() {
        read_chunked_body(reader).await
    } else {
        let len = response.content_length();
        if len <= 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;
        let size_str = size_line.trim().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed chunk size"))?;
        if size == 0 {
            loop {
                let mut trailer_line = String::new();
                let n = reader.read_line(&mut trailer_line).await?;
                if n == 0 || trailer_line == "\r\n" || trailer_line == "\n" {
                    break;
                }
            }
            return Ok(body);
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        body.extend_from_slice(&chunk);
    }
}

/// The framer's reverse operation (spec.md §4.2): emits `"<line>\r\n"`
/// for the start line and each header, then a final bare `\r\n`.
/// Callers on the "write to a possibly-already-closed client" path are
/// expected to tolerate the returned I/O error by logging at debug and
/// continuing (spec.md §4.2, §4.4 step 5, §9).
pub async fn write_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    start_line: &str,
    headers: &[(String, String)],
) -> std::io::Result<()> {
    writer.write_all(start_line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    for (name, value) in headers {
        writer.write_all(name.as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

pub fn response_start_line(head: &ResponseHead) -> String {
    format!("{} {} {}", head.version, head.status, head.reason)
}

pub fn request_start_line(head: &RequestHead) -> String {
    format!("{} {} {}", head.method, head.target, head.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_simple_get() {
        let raw = b"GET /path HTTP/1.1\r\nHost: example.com\r\nX-Foo: Bar\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let head = parse_request_head(&mut reader).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/path");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("Host"), Some("example.com"));
        assert_eq!(head.header("x-foo"), Some("Bar"));
    }

    #[tokio::test]
    async fn content_length_absent_is_minus_one() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let head = parse_request_head(&mut reader).await.unwrap();
        assert_eq!(head.content_length(), -1);
    }

    #[tokio::test]
    async fn chunked_transfer_encoding_is_unknown_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\nContent-Length: 10\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let head = parse_request_head(&mut reader).await.unwrap();
        assert!(head.is_chunked());
        assert_eq!(head.content_length(), -1);
    }

    #[tokio::test]
    async fn read_body_dechunks_a_chunked_entity() {
        let raw = b"HTTP/1.1 407 Proxy Authentication Required\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let response = parse_response_head(&mut reader).await.unwrap();
        assert!(response.is_chunked());
        let body = read_body(&mut reader, &response).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn read_body_reads_content_length_entity() {
        let raw = b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 4\r\n\r\nabcd";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let response = parse_response_head(&mut reader).await.unwrap();
        let body = read_body(&mut reader, &response).await.unwrap();
        assert_eq!(body, b"abcd");
    }

    #[tokio::test]
    async fn bare_blank_line_is_malformed_request_not_a_panic() {
        let raw = b"\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let err = parse_request_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn bare_blank_line_is_upstream_protocol_error_not_a_panic() {
        let raw = b"\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let err = parse_response_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamProtocol(_)));
    }

    #[tokio::test]
    async fn oversized_head_is_malformed_request() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 10));
        raw.extend(b"\r\n\r\n");
        let mut reader = BufReader::new(Cursor::new(raw));
        let err = parse_request_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn parses_status_line() {
        let raw = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let head = parse_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 407);
        assert_eq!(head.reason, "Proxy Authentication Required");
    }

    #[tokio::test]
    async fn idempotent_roundtrip_for_well_formed_head() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\nX-Custom: Val\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let head = parse_request_head(&mut reader).await.unwrap();

        let mut out = Vec::new();
        write_head(&mut out, &request_start_line(&head), &head.headers)
            .await
            .unwrap();
        let mut reader2 = BufReader::new(Cursor::new(out));
        let head2 = parse_request_head(&mut reader2).await.unwrap();

        assert_eq!(head.method, head2.method);
        assert_eq!(head.target, head2.target);
        assert_eq!(head.version, head2.version);
        assert_eq!(head.headers, head2.headers);
    }
}
