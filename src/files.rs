//! Static-file HTTP responder.
//!
//! Serves files below a root directory for requests the server's demux
//! classified as plain HTTP: MIME by suffix, strong ETags with
//! `If-None-Match` revalidation, single-range `Range: bytes=a-b` requests,
//! `OPTIONS` preflight, CORS header echo for requests carrying an
//! `Origin`, and optional gzip of the body.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Request, Response, StatusCode};
use sha1::{Digest, Sha1};

use crate::http::gzip_encode;

/// Response body type used by the HTTP side of the server.
pub type FileResponse = Response<Full<Bytes>>;

/// Serves `req` from `root`.
///
/// `/` maps to `/index.html`; paths escaping the root (via `..`) and
/// missing files yield 404. Errors never propagate: every outcome is an
/// HTTP response.
pub async fn serve_files<B>(req: &Request<B>, root: &Path) -> FileResponse {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    if req.method() == hyper::Method::OPTIONS {
        return with_cors(preflight_response(), origin.as_deref());
    }

    let Some(path) = sanitize_path(root, req.uri().path()) else {
        return with_cors(status_response(StatusCode::NOT_FOUND), origin.as_deref());
    };

    let Ok(contents) = tokio::fs::read(&path).await else {
        log::debug!("file not found: {}", path.display());
        return with_cors(status_response(StatusCode::NOT_FOUND), origin.as_deref());
    };

    let etag = content_etag(&contents);
    let mime = mime_for(&path);

    // Revalidation short-circuits everything else.
    if req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == etag)
    {
        let response = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &etag)
            .body(Full::new(Bytes::new()))
            .expect("static response");
        return with_cors(response, origin.as_deref());
    }

    if let Some(range_header) = req
        .headers()
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
    {
        let response = match parse_range(range_header, contents.len()) {
            Some((start, end)) => Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, mime)
                .header(header::ETAG, &etag)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{}", contents.len()),
                )
                .body(Full::new(Bytes::copy_from_slice(&contents[start..=end])))
                .expect("static response"),
            None => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", contents.len()))
                .body(Full::new(Bytes::new()))
                .expect("static response"),
        };
        return with_cors(response, origin.as_deref());
    }

    let accepts_gzip = req
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"));

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::ETAG, &etag);

    let body = if accepts_gzip {
        match gzip_encode(&contents) {
            Ok(encoded) => {
                builder = builder.header(header::CONTENT_ENCODING, "gzip");
                encoded
            }
            Err(_) => contents,
        }
    } else {
        contents
    };

    let response = builder
        .body(Full::new(Bytes::from(body)))
        .expect("static response");
    with_cors(response, origin.as_deref())
}

/// Resolves a URI path below `root`, rejecting everything that would
/// escape it.
fn sanitize_path(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let rel = match uri_path {
        "/" | "" => "index.html",
        path => path.trim_start_matches('/'),
    };

    let rel = Path::new(rel);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(rel))
}

/// MIME type by file suffix; unknown suffixes fall back to octet-stream.
fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
    {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "ico" => "image/x-icon",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Strong ETag: hex of a content hash.
fn content_etag(contents: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(contents);
    let digest = sha1.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("\"{hex}\"")
}

/// Parses `bytes=a-b` (or `bytes=a-`) into inclusive bounds.
fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = match end.trim() {
        "" => len.checked_sub(1)?,
        end => end.parse().ok()?,
    };
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}

fn preflight_response() -> FileResponse {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

fn status_response(status: StatusCode) -> FileResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

/// Echoes permissive CORS headers when the request carried an `Origin`.
fn with_cors(mut response: FileResponse, origin: Option<&str>) -> FileResponse {
    if let Some(origin) = origin {
        if let Ok(value) = origin.parse() {
            let headers = response.headers_mut();
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, OPTIONS".parse().expect("static header"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "*".parse().expect("static header"),
            );
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn fixture_root() -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let root = std::env::temp_dir().join(format!(
            "windlass-files-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("index.html"), b"<html>home</html>")
            .await
            .unwrap();
        tokio::fs::write(root.join("data.bin"), (0u8..=255).collect::<Vec<_>>())
            .await
            .unwrap();
        root
    }

    #[tokio::test]
    async fn root_maps_to_index_html() {
        let root = fixture_root().await;
        let response = serve_files(&request("/"), &root).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    }

    #[tokio::test]
    async fn missing_files_and_escapes_yield_404() {
        let root = fixture_root().await;
        let response = serve_files(&request("/nope.txt"), &root).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = serve_files(&request("/../etc/passwd"), &root).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn etag_revalidation_returns_304() {
        let root = fixture_root().await;
        let first = serve_files(&request("/index.html"), &root).await;
        let etag = first.headers()[header::ETAG].to_str().unwrap().to_owned();
        assert!(etag.starts_with('"'));

        let revalidation = Request::builder()
            .uri("/index.html")
            .header(header::IF_NONE_MATCH, &etag)
            .body(())
            .unwrap();
        let response = serve_files(&revalidation, &root).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers()[header::ETAG].to_str().unwrap(), etag);
    }

    #[tokio::test]
    async fn byte_ranges_return_206_with_content_range() {
        let root = fixture_root().await;
        let ranged = Request::builder()
            .uri("/data.bin")
            .header(header::RANGE, "bytes=10-19")
            .body(())
            .unwrap();
        let response = serve_files(&ranged, &root).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            "bytes 10-19/256"
        );

        let unsatisfiable = Request::builder()
            .uri("/data.bin")
            .header(header::RANGE, "bytes=500-600")
            .body(())
            .unwrap();
        let response = serve_files(&unsatisfiable, &root).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn options_preflight_and_cors_echo() {
        let root = fixture_root().await;
        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/index.html")
            .header(header::ORIGIN, "https://app.example")
            .body(())
            .unwrap();
        let response = serve_files(&preflight, &root).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example"
        );

        // No Origin, no CORS headers.
        let response = serve_files(&request("/index.html"), &root).await;
        assert!(!response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn gzip_is_applied_when_accepted() {
        let root = fixture_root().await;
        tokio::fs::write(root.join("big.js"), "var x = 1;\n".repeat(200))
            .await
            .unwrap();

        let compressed = Request::builder()
            .uri("/big.js")
            .header(header::ACCEPT_ENCODING, "gzip, deflate")
            .body(())
            .unwrap();
        let response = serve_files(&compressed, &root).await;
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/javascript"
        );
    }

    #[test]
    fn range_parser_handles_open_and_bad_ranges() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_range("bytes=90-", 100), Some((90, 99)));
        assert_eq!(parse_range("bytes=20-10", 100), None);
        assert_eq!(parse_range("bytes=0-100", 100), None);
        assert_eq!(parse_range("lines=0-1", 100), None);
    }

    #[test]
    fn mime_table_covers_the_known_suffixes() {
        assert_eq!(mime_for(Path::new("a.html")), "text/html");
        assert_eq!(mime_for(Path::new("a.css")), "text/css");
        assert_eq!(mime_for(Path::new("a.mjs")), "application/javascript");
        assert_eq!(mime_for(Path::new("a.svg")), "image/svg+xml");
        assert_eq!(mime_for(Path::new("a.wasm")), "application/octet-stream");
    }
}
