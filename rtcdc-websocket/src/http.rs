//! HTTP/1.1 upgrade handshake plumbing.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use rand::RngCore;
use shared::error::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use unicase::UniCase;

/// RFC 6455 section 1.3.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the serialized head of a request or response.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`:
/// `base64(SHA1(key || GUID))`.
pub fn compute_accept_key(key: &str) -> String {
    let input = format!("{key}{WEBSOCKET_GUID}");
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    BASE64_STANDARD.encode(digest.as_ref())
}

/// A random 16-byte value, base64-encoded.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    BASE64_STANDARD.encode(bytes)
}

/// Header names keep their wire casing; lookups are case-insensitive.
#[derive(Debug, Default, Clone)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = UniCase::new(name);
        self.0
            .iter()
            .find(|(key, _)| UniCase::new(key.as_str()) == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub headers: Headers,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
}

/// Reads head lines up to the blank separator line.
async fn read_head<R>(reader: &mut R) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut total = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::ErrConnectionClosed);
        }
        total += n;
        if total > MAX_HEAD_SIZE {
            return Err(Error::ErrWsProtocol("http head too large".to_owned()));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(lines);
        }
        lines.push(line.to_owned());
    }
}

/// Parses header lines after the start line. A continuation line (leading
/// whitespace) or a stray line without a colon is folded into the previous
/// header value with a single space.
fn parse_headers(lines: &[String]) -> Headers {
    let mut headers = Headers::default();
    for line in lines {
        let continuation = line.starts_with(' ') || line.starts_with('\t');
        match line.split_once(':') {
            Some((name, value)) if !continuation => {
                headers.push(name.trim(), value.trim());
            }
            _ => {
                if let Some((_, last)) = headers.0.last_mut() {
                    if !last.is_empty() {
                        last.push(' ');
                    }
                    last.push_str(line.trim());
                }
            }
        }
    }
    headers
}

pub async fn read_request<R>(reader: &mut R) -> Result<HttpRequest>
where
    R: AsyncBufRead + Unpin,
{
    let lines = read_head(reader).await?;
    let start = lines
        .first()
        .ok_or_else(|| Error::ErrWsProtocol("empty request".to_owned()))?;
    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::ErrWsProtocol("bad request line".to_owned()))?
        .to_owned();
    let target = parts
        .next()
        .ok_or_else(|| Error::ErrWsProtocol("bad request line".to_owned()))?
        .to_owned();
    Ok(HttpRequest {
        method,
        target,
        headers: parse_headers(&lines[1..]),
    })
}

pub async fn read_response<R>(reader: &mut R) -> Result<HttpResponse>
where
    R: AsyncBufRead + Unpin,
{
    let lines = read_head(reader).await?;
    let start = lines
        .first()
        .ok_or_else(|| Error::ErrWsProtocol("empty response".to_owned()))?;
    let status = start
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::ErrWsProtocol(format!("bad status line: {start}")))?;
    Ok(HttpResponse {
        status,
        headers: parse_headers(&lines[1..]),
    })
}

/// Serializes the client upgrade request. Caller-supplied headers are
/// written verbatim, preserving their casing.
pub fn upgrade_request(
    host: &str,
    target: &str,
    key: &str,
    extra_headers: &[(String, String)],
) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(&format!("GET {target} HTTP/1.1\r\n"));
    out.push_str(&format!("Host: {host}\r\n"));
    out.push_str("Connection: Upgrade\r\n");
    out.push_str("Upgrade: websocket\r\n");
    out.push_str("Sec-WebSocket-Version: 13\r\n");
    out.push_str(&format!("Sec-WebSocket-Key: {key}\r\n"));
    for (name, value) in extra_headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out
}

/// Validates a server upgrade request and produces the 101 response.
pub fn upgrade_response(request: &HttpRequest) -> Result<String> {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(Error::ErrWsUpgradeFailed(format!(
            "unexpected method {}",
            request.method
        )));
    }
    let upgrade = request.headers.get("Upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::ErrWsUpgradeFailed("not a websocket upgrade".to_owned()));
    }
    let key = request
        .headers
        .get("Sec-WebSocket-Key")
        .ok_or_else(|| Error::ErrWsUpgradeFailed("missing Sec-WebSocket-Key".to_owned()))?;

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: {}\r\n\
\r\n",
        compute_accept_key(key)
    ))
}

/// The `CONNECT` preamble sent to an HTTP proxy before anything else.
pub fn proxy_connect_request(host: &str, port: u16) -> String {
    format!(
        "CONNECT {host}:{port} HTTP/1.1\r\n\
Host: {host}:{port}\r\n\
\r\n"
    )
}

#[cfg(test)]
mod http_test {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // value from RFC 6455 section 1.3
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_key_is_16_bytes() {
        let key = generate_key();
        let raw = BASE64_STANDARD.decode(key).unwrap();
        assert_eq!(raw.len(), 16);
    }

    #[tokio::test]
    async fn test_parse_request_with_bad_formatting() {
        let raw = "GET /p HTTP/1.1\r\n\
Host: localhost\r\n\
X-Badly-Formatted: Hello\r\n\
World\r\n\
\r\n";
        let mut reader = tokio::io::BufReader::new(raw.as_bytes());
        let request = read_request(&mut reader).await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/p");
        // the stray line folds into the previous value with a single space
        assert_eq!(request.headers.get("X-Badly-Formatted"), Some("Hello World"));
        // lookup is case-insensitive, casing is preserved
        assert_eq!(request.headers.get("x-badly-formatted"), Some("Hello World"));
        assert!(request.headers.iter().any(|(k, _)| k == "X-Badly-Formatted"));
    }

    #[tokio::test]
    async fn test_upgrade_response_round_trip() {
        let raw = upgrade_request("localhost:8080", "/path?x=1", "dGhlIHNhbXBsZSBub25jZQ==", &[]);
        let mut reader = tokio::io::BufReader::new(raw.as_bytes());
        let request = read_request(&mut reader).await.unwrap();
        assert_eq!(request.target, "/path?x=1");

        let response = upgrade_response(&request).unwrap();
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[tokio::test]
    async fn test_upgrade_rejects_non_get() {
        let raw = "POST / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: x\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(raw.as_bytes());
        let request = read_request(&mut reader).await.unwrap();
        assert!(upgrade_response(&request).is_err());
    }

    #[tokio::test]
    async fn test_parse_response() {
        let raw = "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: abc\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(raw.as_bytes());
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.status, 101);
        assert_eq!(response.headers.get("sec-websocket-accept"), Some("abc"));
    }
}
