//! Minimal HTTP/1.1 plumbing shared by the proxy arms.
//!
//! The listener speaks raw TCP: the head is read up to the first blank line
//! (64 KiB cap), parsed here, and any bytes read past the head are handed
//! back so body reads lose nothing. All local responses close the
//! connection; there is no keep-alive.

use crate::error::{ProxyError, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Maximum size of a request head (request line + headers).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum body size accepted on local endpoints (2 MiB; the memory cap of
/// 1 MiB is enforced separately so oversize bodies get a precise 413).
pub const MAX_LOCAL_BODY_BYTES: usize = 2 * 1024 * 1024;

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup (first occurrence).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parsed `Content-Length`, if present and valid.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// The `Host` header value with any `:port` suffix removed.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.header("host")
            .map(|h| h.rsplit_once(':').map_or(h, |(host, _)| host))
    }
}

/// Read the request head from the client.
///
/// Returns `None` when the client disconnected before sending anything.
/// The second element is any data read past the head (start of the body).
pub async fn read_head(stream: &mut TcpStream) -> Result<Option<(RequestHead, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::HttpParse(
                "request head exceeds 64 KiB".to_string(),
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::HttpParse(
                "connection closed mid-head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = parse_head(&buf[..head_end])?;
    let leftover = buf[head_end + 4..].to_vec();
    Ok(Some((head, leftover)))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(raw: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProxyError::HttpParse("request head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            request_line
        )));
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Read exactly `len` body bytes, consuming `leftover` first.
pub async fn read_body(stream: &mut TcpStream, leftover: &[u8], len: usize) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(len);
    let pre = leftover.len().min(len);
    body.extend_from_slice(&leftover[..pre]);
    if body.len() < len {
        let mut rest = vec![0u8; len - body.len()];
        stream.read_exact(&mut rest).await?;
        body.extend_from_slice(&rest);
    }
    Ok(body)
}

/// Write a JSON response with `Connection: close` and exit the exchange.
pub async fn write_json(stream: &mut TcpStream, status: u16, body: &Value) -> std::io::Result<()> {
    let payload = body.to_string();
    write_response(
        stream,
        status,
        &[("Content-Type", "application/json".to_string())],
        payload.as_bytes(),
    )
    .await
}

/// Write a full HTTP/1.1 response. `Content-Length` and `Connection: close`
/// are always appended.
pub async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(&str, String)],
    body: &[u8],
) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_reason(status));
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Canonical reason phrases for the statuses the proxy emits.
#[must_use]
pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}
