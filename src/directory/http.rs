//! Minimal HTTP/1.0 for directory requests
//!
//! Directory servers close the connection after the body, so a response
//! is read to EOF. Bodies of `.z` resources are zlib; some servers send
//! gzip instead, so the format is detected from the first bytes.

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TorError};

const MAX_HEADERS: usize = 32;
const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// The body, or a `Directory` error naming the status
    pub fn into_body(self, what: &str) -> Result<Vec<u8>> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(TorError::Directory(format!("{}: HTTP {}", what, self.status)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

pub fn build_request(method: &str, path: &str, host: &str, body: &[u8]) -> Vec<u8> {
    let mut request = format!(
        "{} {} HTTP/1.0\r\nHost: {}\r\nAccept-Encoding: deflate, gzip\r\n",
        method, path, host
    );
    if !body.is_empty() || method == "POST" {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    let mut bytes = request.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

pub fn encode_response(status: u16, body: &[u8]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let mut bytes = format!(
        "HTTP/1.0 {} {}\r\nContent-Length: {}\r\n\r\n",
        status,
        reason,
        body.len()
    )
    .into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<Option<usize>> {
    match headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Content-Length"))
    {
        Some(h) => std::str::from_utf8(h.value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| TorError::ParseError("bad Content-Length".into())),
        None => Ok(None),
    }
}

/// Parse a complete response read up to EOF
pub fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response
        .parse(raw)
        .map_err(|e| TorError::Directory(format!("bad HTTP response: {}", e)))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(TorError::Directory("HTTP response headers truncated".into()))
        }
    };
    let status = response
        .code
        .ok_or_else(|| TorError::Directory("HTTP response without status".into()))?;
    let mut body = raw[head_len..].to_vec();
    if let Some(len) = content_length(response.headers)? {
        if body.len() < len {
            return Err(TorError::Directory(format!(
                "HTTP body truncated ({} of {} bytes)",
                body.len(),
                len
            )));
        }
        body.truncate(len);
    }
    Ok(HttpResponse { status, body })
}

/// Parse a request once all of it has arrived
///
/// Returns `Ok(None)` while the headers or the announced body are
/// incomplete.
pub fn parse_request(raw: &[u8]) -> Result<Option<HttpRequest>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let head_len = match request
        .parse(raw)
        .map_err(|e| TorError::ParseError(format!("bad HTTP request: {}", e)))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            if raw.len() > MAX_HEADER_BYTES {
                return Err(TorError::ParseError("HTTP request headers too long".into()));
            }
            return Ok(None);
        }
    };
    let body_len = content_length(request.headers)?.unwrap_or(0);
    if raw.len() < head_len + body_len {
        return Ok(None);
    }
    Ok(Some(HttpRequest {
        method: request.method.unwrap_or("GET").to_string(),
        path: request.path.unwrap_or("/").to_string(),
        body: raw[head_len..head_len + body_len].to_vec(),
    }))
}

/// Send `request` and read the whole response, at most `max_bytes`
pub async fn exchange<S>(stream: &mut S, request: &[u8], max_bytes: usize) -> Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        if raw.len() > max_bytes {
            return Err(TorError::ResourceExhausted(format!(
                "directory response exceeds {} bytes",
                max_bytes
            )));
        }
    }
    parse_response(&raw)
}

/// Inflate a zlib or gzip body
pub fn decompress(body: &[u8], max_bytes: usize) -> Result<Vec<u8>> {
    let limit = max_bytes as u64 + 1;
    let mut out = Vec::new();
    let result = match body {
        [0x1f, 0x8b, ..] => GzDecoder::new(body).take(limit).read_to_end(&mut out),
        [cmf, flg, ..] if cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0 => {
            ZlibDecoder::new(body).take(limit).read_to_end(&mut out)
        }
        _ => return Err(TorError::Directory("body is neither zlib nor gzip".into())),
    };
    result.map_err(|e| TorError::Directory(format!("decompression failed: {}", e)))?;
    if out.len() > max_bytes {
        return Err(TorError::ResourceExhausted(format!(
            "decompressed directory document exceeds {} bytes",
            max_bytes
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_parse_response() {
        let raw = encode_response(200, b"network-status-version 3\n");
        let response = parse_response(&raw).unwrap();
        assert!(response.is_success());
        assert_eq!(response.body, b"network-status-version 3\n");

        let missing = parse_response(&encode_response(404, b"")).unwrap();
        assert!(missing.into_body("consensus").is_err());
        assert!(parse_response(b"HTTP/1.0 200 OK\r\nContent-Le").is_err());
    }

    #[test]
    fn test_truncated_body() {
        let mut raw = encode_response(200, b"0123456789");
        raw.truncate(raw.len() - 3);
        assert!(parse_response(&raw).is_err());
    }

    #[test]
    fn test_parse_request_waits_for_body() {
        let raw = build_request("POST", "/tor/rendezvous2/publish", "10.0.0.1", b"hs-descriptor 1\n");
        assert_eq!(parse_request(&raw[..20]).unwrap(), None);
        assert_eq!(parse_request(&raw[..raw.len() - 1]).unwrap(), None);
        let request = parse_request(&raw).unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/tor/rendezvous2/publish");
        assert_eq!(request.body, b"hs-descriptor 1\n");

        let get = build_request("GET", "/tor/keys/all", "x", b"");
        assert_eq!(parse_request(&get).unwrap().unwrap().body, b"");
    }

    #[test]
    fn test_decompress_detects_format() {
        let text = b"router test 10.0.0.1 9001 0 0\n".repeat(20);

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&text).unwrap();
        assert_eq!(decompress(&zlib.finish().unwrap(), 1 << 20).unwrap(), text);

        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        gzip.write_all(&text).unwrap();
        assert_eq!(decompress(&gzip.finish().unwrap(), 1 << 20).unwrap(), text);

        assert!(decompress(&text, 1 << 20).is_err());
        assert!(decompress(&[0x78, 0x9c, 1, 2, 3], 1 << 20).is_err());
    }

    #[test]
    fn test_decompress_limit() {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&[b'a'; 4096]).unwrap();
        assert!(matches!(
            decompress(&zlib.finish().unwrap(), 1024),
            Err(TorError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /tor/server/all HTTP/1.0"));
            server.write_all(&encode_response(200, b"body")).await.unwrap();
        });
        let mut client = tokio_util::compat::TokioAsyncReadCompatExt::compat(client);
        let request = build_request("GET", "/tor/server/all", "x", b"");
        let response = exchange(&mut client, &request, 1 << 20).await.unwrap();
        assert_eq!(response.body, b"body");
    }
}
