//! Boundary helpers around the HTTP layer.
//!
//! hyper owns request/response parsing; what lives here is the glue the
//! rest of the crate needs at that boundary: a raw CRLF line reader for
//! the byte-level proxy negotiation (which happens beneath any HTTP
//! machinery), strict `Content-Length` handling, case-insensitive header
//! comparison, and gzip transcoding of message bodies.

use std::io::{Read, Write};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{body::Body, header, HeaderMap};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Result, WebSocketError};

/// Longest line accepted by [`read_line`]; longer lines fail the exchange.
pub(crate) const MAX_LINE_LENGTH: usize = 8192;

/// Reads one `\r\n`-terminated line from `stream`, returning it without the
/// terminator.
///
/// Reads byte-by-byte: this runs only during proxy negotiation, where
/// overshooting the header block would swallow bytes that belong to the
/// tunneled protocol.
pub(crate) async fn read_line<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line).map_err(|_| WebSocketError::InvalidUtf8);
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(WebSocketError::Proxy(format!(
                "line exceeded {MAX_LINE_LENGTH} bytes"
            )));
        }
    }
}

/// Case-insensitive comparison of a header against an expected token.
pub(crate) fn header_eq(headers: &HeaderMap, name: header::HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// Parses `Content-Length` with the strictness the reference applies: the
/// value must fit a non-negative 32-bit integer, with no sign or trailing
/// garbage. A missing header yields `Ok(None)`.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| WebSocketError::Proxy("invalid Content-Length".into()))?;
    if text.starts_with('+') || text.starts_with('-') {
        return Err(WebSocketError::Proxy("invalid Content-Length".into()));
    }
    let parsed: i32 = text
        .parse()
        .map_err(|_| WebSocketError::Proxy("invalid Content-Length".into()))?;
    Ok(Some(parsed as usize))
}

/// Collects a request body, enforcing the declared `Content-Length` and
/// decoding `Content-Encoding: gzip` when present.
pub(crate) async fn collect_body<B>(headers: &HeaderMap, body: B) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: Into<WebSocketError>,
{
    let declared = content_length(headers)?;
    let collected = body
        .collect()
        .await
        .map_err(Into::into)?
        .to_bytes();

    if let Some(declared) = declared {
        if collected.len() != declared {
            return Err(WebSocketError::Proxy(format!(
                "body length {} does not match Content-Length {declared}",
                collected.len()
            )));
        }
    }

    if header_eq(headers, header::CONTENT_ENCODING, "gzip") {
        return gzip_decode(&collected).map(Bytes::from);
    }
    Ok(collected)
}

/// Inflates a gzip body.
pub(crate) fn gzip_decode(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output)?;
    Ok(output)
}

/// Gzips a response body.
pub(crate) fn gzip_encode(input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH};

    #[tokio::test]
    async fn read_line_strips_the_terminator() {
        let (mut client, server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut server = server;
            server.write_all(b"HTTP/1.1 200 OK\r\nrest").await.unwrap();
        });
        let line = read_line(&mut client).await.unwrap();
        assert_eq!(line, "HTTP/1.1 200 OK");
    }

    #[tokio::test]
    async fn read_line_caps_length() {
        let (mut client, server) = tokio::io::duplex(MAX_LINE_LENGTH * 2);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut server = server;
            server.write_all(&vec![b'a'; MAX_LINE_LENGTH + 2]).await.unwrap();
        });
        assert!(matches!(
            read_line(&mut client).await,
            Err(WebSocketError::Proxy(_))
        ));
    }

    #[test]
    fn header_comparison_ignores_case() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        assert!(header_eq(&headers, CONNECTION, "Upgrade"));
        assert!(!header_eq(&headers, CONNECTION, "close"));
    }

    #[test]
    fn content_length_rejects_sign_and_garbage() {
        for bad in ["-1", "+5", "12abc", "4294967296"] {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_LENGTH, HeaderValue::from_str(bad).unwrap());
            assert!(content_length(&headers).is_err(), "value: {bad}");
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers).unwrap(), Some(42));
        assert_eq!(content_length(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn gzip_round_trip() {
        let body = b"compressible body compressible body";
        let encoded = gzip_encode(body).unwrap();
        assert_ne!(&encoded[..], &body[..]);
        assert_eq!(gzip_decode(&encoded).unwrap(), body);
    }

    #[tokio::test]
    async fn collect_body_enforces_length_and_decodes_gzip() {
        use http_body_util::Full;
        use hyper::header::CONTENT_ENCODING;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4"));
        let body = collect_body(&headers, Full::new(Bytes::from_static(b"abcd")))
            .await
            .unwrap();
        assert_eq!(&body[..], b"abcd");

        // Declared length must match the received bytes.
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        assert!(
            collect_body(&headers, Full::new(Bytes::from_static(b"abcd")))
                .await
                .is_err()
        );

        let encoded = gzip_encode(b"unzipped payload").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let body = collect_body(&headers, Full::new(Bytes::from(encoded)))
            .await
            .unwrap();
        assert_eq!(&body[..], b"unzipped payload");
    }
}
