//! Transport-level configuration.

use std::time::Duration;

use crate::compression::DeflateParams;

/// Compression level for outbound messages, re-exported from `flate2`.
pub type CompressionLevel = flate2::Compression;

/// Default cap on a single inbound frame payload: 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Default cap on the fragment-reassembly buffer: 2 MiB.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Configuration for one WebSocket connection.
///
/// These are the knobs of the protocol core itself; connection supervision
/// (reconnects, heartbeats, timeouts around the socket) lives in
/// [`EndpointOptions`](crate::EndpointOptions).
#[derive(Clone, Default)]
pub struct Options {
    /// Maximum accepted payload size of a single inbound frame. Larger
    /// frames close the connection. Default [`MAX_PAYLOAD_READ`].
    pub max_payload_read: Option<usize>,

    /// Maximum bytes accumulated while reassembling a fragmented message.
    /// Default [`MAX_READ_BUFFER`], or twice `max_payload_read` when that
    /// is set.
    pub max_read_buffer: Option<usize>,

    /// permessage-deflate offer/acceptance. `None` disables compression.
    pub compression: Option<DeflateOptions>,

    /// Outbound messages larger than this are fragmented into frames of at
    /// most this size. `None` sends every message as a single frame.
    pub fragment_size: Option<usize>,

    /// Maximum time to wait for the remaining fragments of a partially
    /// received message.
    pub fragment_timeout: Option<Duration>,

    /// Validate UTF-8 of complete text messages. On by default; disabling
    /// it is for peers that are trusted to send valid text.
    pub skip_utf8_check: bool,

    /// Answer inbound pings with pongs automatically. On by default.
    pub disable_auto_pong: bool,
}

impl Options {
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: Some(size),
            ..self
        }
    }

    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Fragment outbound messages into frames of at most `size` bytes.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: Some(size),
            ..self
        }
    }

    pub fn with_fragment_timeout(self, timeout: Duration) -> Self {
        Self {
            fragment_timeout: Some(timeout),
            ..self
        }
    }

    pub fn without_utf8_check(self) -> Self {
        Self {
            skip_utf8_check: true,
            ..self
        }
    }

    pub fn without_auto_pong(self) -> Self {
        Self {
            disable_auto_pong: true,
            ..self
        }
    }

    pub(crate) fn effective_max_payload_read(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    pub(crate) fn effective_max_read_buffer(&self) -> usize {
        self.max_read_buffer
            .unwrap_or_else(|| self.max_payload_read.map(|n| n * 2).unwrap_or(MAX_READ_BUFFER))
    }
}

/// permessage-deflate preferences for one side.
///
/// What actually applies to a connection is the agreement produced during
/// the handshake: the client sends [`DeflateOptions::offer`], the server
/// answers with [`DeflateOptions::merge`] applied to the client's offer.
#[derive(Clone, Default)]
pub struct DeflateOptions {
    /// Compression level (0-9) used for outbound messages.
    pub level: CompressionLevel,

    /// Request that the server reset its compression dictionary after
    /// every message.
    pub server_no_context_takeover: bool,

    /// Request (client side) or demand (server side) per-message reset of
    /// the client's compression dictionary.
    pub client_no_context_takeover: bool,

    /// Preferred LZ77 window size for the server's compressor, 9-15 bits.
    pub server_max_window_bits: Option<u8>,

    /// Preferred LZ77 window size for the client's compressor, 9-15 bits.
    pub client_max_window_bits: Option<u8>,
}

impl DeflateOptions {
    /// Low compression effort, minimal CPU per message.
    pub fn low_latency() -> Self {
        Self {
            level: CompressionLevel::fast(),
            ..Self::default()
        }
    }

    /// Maximum compression ratio for bandwidth-bound links.
    pub fn high_compression() -> Self {
        Self {
            level: CompressionLevel::best(),
            ..Self::default()
        }
    }

    pub fn with_level(self, level: CompressionLevel) -> Self {
        Self { level, ..self }
    }

    /// The extension parameters a client puts in its upgrade request.
    pub(crate) fn offer(&self) -> DeflateParams {
        DeflateParams {
            server_no_context_takeover: self.server_no_context_takeover,
            client_no_context_takeover: self.client_no_context_takeover,
            server_max_window_bits: self.server_max_window_bits.map(Some),
            client_max_window_bits: self.client_max_window_bits.map(Some),
        }
    }

    /// Server-side agreement: combines the client's offer with this
    /// configuration into the parameters echoed in the 101 response.
    pub(crate) fn merge(&self, offered: &DeflateParams) -> DeflateParams {
        DeflateParams {
            // Either side may demand a stateless direction.
            client_no_context_takeover: offered.client_no_context_takeover
                || self.client_no_context_takeover,
            server_no_context_takeover: offered.server_no_context_takeover
                || self.server_no_context_takeover,
            client_max_window_bits: merge_window_bits(
                offered.client_max_window_bits,
                self.client_max_window_bits,
            ),
            server_max_window_bits: merge_window_bits(
                offered.server_max_window_bits,
                self.server_max_window_bits,
            ),
        }
    }
}

/// Window-bits agreement for one direction.
fn merge_window_bits(offered: Option<Option<u8>>, own: Option<u8>) -> Option<Option<u8>> {
    match (offered, own) {
        // Peer offered a value and we have a preference: the smaller wins.
        (Some(Some(peer)), Some(own)) => Some(Some(peer.min(own))),
        // Peer offered a value, we have no preference: accept it.
        (Some(Some(peer)), None) => Some(Some(peer)),
        // Peer offered the parameter without a value: answer with our
        // preference, or the minimum the RFC allows.
        (Some(None), Some(own)) => Some(Some(own)),
        (Some(None), None) => Some(Some(9)),
        // Peer did not offer the parameter.
        (None, own) => own.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_honors_either_sides_context_takeover() {
        let server = DeflateOptions::default();
        let offer = DeflateParams {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            ..Default::default()
        };
        let agreed = server.merge(&offer);
        assert!(agreed.server_no_context_takeover);
        assert!(agreed.client_no_context_takeover);

        let server = DeflateOptions {
            server_no_context_takeover: true,
            ..Default::default()
        };
        let agreed = server.merge(&DeflateParams::default());
        assert!(agreed.server_no_context_takeover);
        assert!(!agreed.client_no_context_takeover);
    }

    #[test]
    fn merge_takes_the_smaller_window() {
        let server = DeflateOptions {
            server_max_window_bits: Some(15),
            client_max_window_bits: Some(15),
            ..Default::default()
        };
        let offer = DeflateParams {
            server_max_window_bits: Some(Some(12)),
            client_max_window_bits: Some(Some(10)),
            ..Default::default()
        };
        let agreed = server.merge(&offer);
        assert_eq!(agreed.server_max_window_bits, Some(Some(12)));
        assert_eq!(agreed.client_max_window_bits, Some(Some(10)));
    }

    #[test]
    fn merge_answers_valueless_offers() {
        let server = DeflateOptions {
            client_max_window_bits: Some(12),
            ..Default::default()
        };
        let offer = DeflateParams {
            client_max_window_bits: Some(None),
            ..Default::default()
        };
        assert_eq!(server.merge(&offer).client_max_window_bits, Some(Some(12)));

        let server = DeflateOptions::default();
        assert_eq!(server.merge(&offer).client_max_window_bits, Some(Some(9)));
    }

    #[test]
    fn merge_leaves_unoffered_parameters_alone() {
        let agreed = DeflateOptions::default().merge(&DeflateParams::default());
        assert_eq!(agreed.server_max_window_bits, None);
        assert_eq!(agreed.client_max_window_bits, None);
    }

    #[test]
    fn read_buffer_defaults_track_payload_limit() {
        let options = Options::default();
        assert_eq!(options.effective_max_read_buffer(), MAX_READ_BUFFER);

        let options = Options::default().with_max_payload_read(64 * 1024);
        assert_eq!(options.effective_max_read_buffer(), 128 * 1024);
    }
}
