//! Server-side WebSocket upgrade.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use base64::prelude::*;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, upgrade::Upgraded, Request, Response};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};

use crate::{
    codec::Role,
    compression::DeflateParams,
    ws::{Negotiation, Options, WebSocket},
    Result, WebSocketError,
};

/// Fixed GUID appended to the client key before hashing, per RFC 6455
/// Section 1.3.
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response sent back during a successful upgrade; the body stays empty
/// because the connection switches protocols right after.
pub type HttpResponse = Response<Empty<Bytes>>;

/// A WebSocket running over an upgraded hyper connection.
pub type HttpWebSocket = WebSocket<TokioIo<Upgraded>>;

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(ACCEPT_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generates a random 16-byte `Sec-WebSocket-Key`, base64-encoded.
pub(crate) fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Everything the server learns from a validated upgrade request.
pub(crate) struct ServerUpgrade {
    /// `101 Switching Protocols` response to send back.
    pub response: HttpResponse,
    /// Resolves into the WebSocket once the response has gone out.
    pub fut: UpgradeFut,
    /// Sub-protocol selected from the client's offer, if any.
    pub protocol: Option<String>,
}

/// Validates a client upgrade request and prepares the switch.
///
/// Enforces the RFC 6455 server requirements: GET, HTTP/1.1,
/// `Sec-WebSocket-Key`, `Upgrade: websocket` (Firefox's
/// `keep-alive, Upgrade` is accepted as well) and version 13. Sub-protocol
/// selection picks the first configured protocol that occurs in the
/// client's `Sec-WebSocket-Protocol` header; the match is a substring test.
pub(crate) fn upgrade_request<B>(
    request: &mut Request<B>,
    options: &Options,
    sub_protocols: &[String],
    server_header: &str,
) -> Result<ServerUpgrade> {
    if request.method() != hyper::Method::GET {
        return Err(WebSocketError::InvalidHttpMethod(
            request.method().to_string(),
        ));
    }
    if request.version() != hyper::Version::HTTP_11 {
        return Err(WebSocketError::InvalidHttpVersion);
    }

    let headers = request.headers();

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    let upgrade_ok = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket") || value == "keep-alive, Upgrade")
        .unwrap_or(false);
    if !upgrade_ok {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|value| value.as_bytes())
        != Some(b"13")
    {
        return Err(WebSocketError::InvalidSecWebSocketVersion);
    }

    let client_offer = headers
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<DeflateParams>().ok());

    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|client_protocols| {
            sub_protocols
                .iter()
                .find(|candidate| client_protocols.contains(candidate.as_str()))
                .cloned()
        });

    let mut response = Response::builder()
        .status(hyper::StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key.as_bytes()))
        .header(header::SERVER, server_header);

    if let Some(protocol) = &protocol {
        response = response.header(header::SEC_WEBSOCKET_PROTOCOL, protocol.as_str());
    }

    let agreed = match (client_offer, options.compression.as_ref()) {
        (Some(client_offer), Some(server_options)) => {
            let agreed = server_options.merge(&client_offer);
            response = response.header(header::SEC_WEBSOCKET_EXTENSIONS, agreed.to_string());
            Some(agreed)
        }
        _ => None,
    };

    let response = response.body(Empty::new())?;

    let fut = UpgradeFut {
        inner: hyper::upgrade::on(request),
        negotiation: Some(Negotiation::from_options(options, agreed)),
    };

    Ok(ServerUpgrade {
        response,
        fut,
        protocol,
    })
}

/// Completes the protocol switch after the 101 response has been sent,
/// yielding the server-side [`WebSocket`].
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    negotiation: Option<Negotiation>,
}

impl std::future::Future for UpgradeFut {
    type Output = Result<HttpWebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match this.inner.poll(cx) {
            Poll::Ready(upgraded) => upgraded?,
            Poll::Pending => return Poll::Pending,
        };

        let negotiation = this.negotiation.take().expect("polled after completion");
        Poll::Ready(Ok(WebSocket::new(
            Role::Server,
            TokioIo::new(upgraded),
            Bytes::new(),
            negotiation,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::DeflateOptions;

    fn upgrade_req(key: &str) -> Request<()> {
        Request::builder()
            .method("GET")
            .uri("/chat")
            .header(header::HOST, "example.com")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, key)
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap()
    }

    #[test]
    fn accept_key_matches_the_rfc_vector() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn accept_key_is_deterministic_for_random_keys() {
        for _ in 0..1000 {
            let nonce: [u8; 16] = rand::random();
            let key = BASE64_STANDARD.encode(nonce);
            // The client and server derive the value independently; both
            // must agree byte for byte.
            assert_eq!(accept_key(key.as_bytes()), accept_key(key.as_bytes()));
            assert_eq!(accept_key(key.as_bytes()).len(), 28);
        }
    }

    #[test]
    fn generated_keys_decode_to_16_bytes() {
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(key).unwrap().len(), 16);
    }

    #[test]
    fn upgrade_echoes_the_accept_key() {
        let mut req = upgrade_req("dGhlIHNhbXBsZSBub25jZQ==");
        let upgrade = upgrade_request(&mut req, &Options::default(), &[], "test-server").unwrap();

        assert_eq!(upgrade.response.status(), 101);
        assert_eq!(
            upgrade.response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(upgrade.response.headers()[header::SERVER], "test-server");
        assert!(upgrade.protocol.is_none());
    }

    #[test]
    fn upgrade_requires_get_and_key_and_version() {
        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        *req.method_mut() = hyper::Method::POST;
        assert!(matches!(
            upgrade_request(&mut req, &Options::default(), &[], "s"),
            Err(WebSocketError::InvalidHttpMethod(_))
        ));

        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        req.headers_mut().remove(header::SEC_WEBSOCKET_KEY);
        assert!(matches!(
            upgrade_request(&mut req, &Options::default(), &[], "s"),
            Err(WebSocketError::MissingSecWebSocketKey)
        ));

        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        req.headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, "8".parse().unwrap());
        assert!(matches!(
            upgrade_request(&mut req, &Options::default(), &[], "s"),
            Err(WebSocketError::InvalidSecWebSocketVersion)
        ));
    }

    #[test]
    fn firefox_upgrade_header_is_accepted() {
        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        req.headers_mut()
            .insert(header::UPGRADE, "keep-alive, Upgrade".parse().unwrap());
        assert!(upgrade_request(&mut req, &Options::default(), &[], "s").is_ok());

        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        req.headers_mut()
            .insert(header::UPGRADE, "h2c".parse().unwrap());
        assert!(matches!(
            upgrade_request(&mut req, &Options::default(), &[], "s"),
            Err(WebSocketError::InvalidUpgradeHeader)
        ));
    }

    #[test]
    fn first_configured_protocol_in_client_list_wins() {
        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        req.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "msgpack, json".parse().unwrap(),
        );

        let protocols = vec!["json".to_string(), "msgpack".to_string()];
        let upgrade =
            upgrade_request(&mut req, &Options::default(), &protocols, "s").unwrap();

        // Server preference order decides, not client order.
        assert_eq!(upgrade.protocol.as_deref(), Some("json"));
        assert_eq!(
            upgrade.response.headers()[header::SEC_WEBSOCKET_PROTOCOL],
            "json"
        );
    }

    #[test]
    fn deflate_offer_is_merged_and_echoed() {
        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        req.headers_mut().insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            "permessage-deflate; client_no_context_takeover"
                .parse()
                .unwrap(),
        );

        let options = Options::default().with_compression(DeflateOptions::default());
        let upgrade = upgrade_request(&mut req, &options, &[], "s").unwrap();

        let echoed = upgrade.response.headers()[header::SEC_WEBSOCKET_EXTENSIONS]
            .to_str()
            .unwrap()
            .to_owned();
        assert!(echoed.starts_with("permessage-deflate"));
        assert!(echoed.contains("client_no_context_takeover"));
    }

    #[test]
    fn no_extension_is_echoed_without_server_support() {
        let mut req = upgrade_req("a2V5a2V5a2V5a2V5a2V5a2==");
        req.headers_mut().insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            "permessage-deflate".parse().unwrap(),
        );

        let upgrade = upgrade_request(&mut req, &Options::default(), &[], "s").unwrap();
        assert!(!upgrade
            .response
            .headers()
            .contains_key(header::SEC_WEBSOCKET_EXTENSIONS));
    }
}
