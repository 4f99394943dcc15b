//! The local-client protocol: a single HTTP/1.0 `CONNECT` request line,
//! read and validated before a slot is ever allocated for it.

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// A validated `CONNECT` request: just the target, everything else in the
/// request line is discardable once it has passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub hostport: String,
}

/// Reads one byte at a time off `stream` until `\r\n\r\n` or `max_len` is
/// reached, then validates the request line. `Ok(None)` covers every
/// validation failure (oversized header, premature EOF, malformed request
/// line) uniformly — the caller's only job on `None` is to answer `400` and
/// walk away without ever touching the slot table.
pub async fn read_connect_request(
    stream: &mut TcpStream,
    max_len: usize,
) -> std::io::Result<Option<ConnectRequest>> {
    let mut buf = Vec::with_capacity(max_len.min(256));
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= max_len {
            return Ok(None);
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(parse_connect_request(&buf))
}

/// Validates a complete request head: the request line must be `CONNECT
/// <hostport> HTTP/1.x`, and the whole thing is UTF-8.
fn parse_connect_request(buf: &[u8]) -> Option<ConnectRequest> {
    let text = std::str::from_utf8(buf).ok()?;
    let request_line = text.lines().next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if method != "CONNECT" || !version.starts_with("HTTP/1.") {
        return None;
    }
    Some(ConnectRequest {
        hostport: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_well_formed_request_line() {
        let req = parse_connect_request(b"CONNECT example.com:80 HTTP/1.0\r\nHost: x\r\n\r\n")
            .expect("should validate");
        assert_eq!(req.hostport, "example.com:80");
    }

    #[test]
    fn rejects_wrong_method() {
        assert!(parse_connect_request(b"GET example.com:80 HTTP/1.0\r\n\r\n").is_none());
    }

    #[test]
    fn rejects_missing_tokens() {
        assert!(parse_connect_request(b"CONNECT HTTP/1.0\r\n\r\n").is_none());
    }

    #[test]
    fn rejects_extra_tokens() {
        assert!(parse_connect_request(b"CONNECT a:1 HTTP/1.0 extra\r\n\r\n").is_none());
    }

    #[test]
    fn rejects_non_http_version_token() {
        assert!(parse_connect_request(b"CONNECT a:1 FOO/1.0\r\n\r\n").is_none());
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(parse_connect_request(&[0x43, 0xff, 0xfe]).is_none());
    }
}
