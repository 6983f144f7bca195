//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A message is one or more frames: the first carries the data opcode
//! (`Text` or `Binary`), any following fragments carry `Continuation`, and
//! the last sets FIN. Control frames (`Close`, `Ping`, `Pong`) are never
//! fragmented and carry at most 125 payload bytes.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! ```
//!
//! RSV1 doubles as the permessage-deflate "compressed" flag on the first
//! frame of a message; RSV2 and RSV3 must be zero.

use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// Largest possible frame header: 2 bytes of flags/length, 8 bytes of
/// extended length, 4 bytes of masking key.
pub(crate) const MAX_HEADER_SIZE: usize = 14;

/// Maximum payload of a control frame (close, ping, pong).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame type identifier.
///
/// The numeric values are fixed by
/// [RFC 6455 Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8);
/// opcodes 0x3-0x7 and 0xB-0xF are reserved and rejected during decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Whether this opcode names a control frame (`Close`, `Ping`, `Pong`).
    ///
    /// Control frames must have FIN set, carry at most 125 payload bytes,
    /// and are processed immediately even when they interleave a
    /// fragmented message.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single WebSocket frame.
///
/// Constructed through the factory methods ([`Frame::text`],
/// [`Frame::binary`], [`Frame::ping`], [`Frame::close`], ...) which produce
/// final (FIN=1) frames; [`Frame::with_fin`] and [`Frame::continuation`]
/// exist for manual fragmentation. Masking is not part of the public
/// surface: the codec applies a fresh random key per frame when encoding on
/// the client side and strips the key when decoding on the server side.
pub struct Frame {
    /// Final fragment flag. `true` completes a message.
    pub fin: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// RSV1: payload is (part of) a deflate-compressed message.
    pub(crate) compressed: bool,
    /// Masking key, present on frames decoded from a masked peer and on
    /// frames the encoder has masked.
    pub(crate) mask: Option<[u8; 4]>,
    /// Set on a delivered message whose payload failed to inflate; the
    /// payload then holds the raw compressed bytes and the connection is
    /// closing with code 1007.
    pub(crate) decompression_failed: bool,
    /// Payload bytes, already unmasked.
    pub payload: BytesMut,
}

impl Frame {
    pub(crate) fn new(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            opcode,
            compressed: false,
            mask: None,
            decompression_failed: false,
            payload: payload.into(),
        }
    }

    /// A final text frame. The payload is not validated here; UTF-8 is
    /// checked when a complete message is assembled.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, payload.as_ref())
    }

    /// A final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, payload.as_ref())
    }

    /// A continuation fragment, final unless [`Frame::with_fin`] clears it.
    pub fn continuation(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Continuation, payload.as_ref())
    }

    /// A ping frame. Payload must not exceed [`MAX_CONTROL_PAYLOAD`]; the
    /// transport rejects larger ones before they reach the wire.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, payload.as_ref())
    }

    /// A pong frame, normally mirroring a received ping's payload.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, payload.as_ref())
    }

    /// A close frame carrying `code` and a reason string.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(true, OpCode::Close, payload)
    }

    /// A close frame with a raw payload, used when echoing the peer's close
    /// frame byte-for-byte.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, payload.as_ref())
    }

    /// Clears or sets the FIN flag, for manual fragmentation.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Whether this frame completes a message.
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Whether RSV1 was set (payload belongs to a compressed message).
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Whether this delivered message could not be decompressed. The
    /// payload holds the raw bytes and the connection closes with 1007.
    pub fn decompression_failed(&self) -> bool {
        self.decompression_failed
    }

    /// The close code of a close frame, if the payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let bytes = self.payload.get(0..2)?;
        Some(CloseCode::from(u16::from_be_bytes([bytes[0], bytes[1]])))
    }

    /// The UTF-8 reason of a close frame.
    ///
    /// Returns `Ok(None)` when the payload has no reason bytes and an
    /// `InvalidUtf8` error when the reason is not valid UTF-8, which is a
    /// protocol violation.
    pub fn close_reason(&self) -> crate::Result<Option<&str>> {
        if self.payload.len() <= 2 {
            return Ok(None);
        }
        std::str::from_utf8(&self.payload[2..])
            .map(Some)
            .map_err(|_| WebSocketError::InvalidUtf8)
    }

    /// Serializes the frame header into `head`, returning its length.
    pub(crate) fn encode_header(&self, head: &mut [u8; MAX_HEADER_SIZE]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.compressed as u8) << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }

    /// Masks the payload in place. Generates a fresh random key when none
    /// is set.
    pub(crate) fn mask_payload(&mut self) {
        let key = match self.mask {
            Some(key) => key,
            None => {
                let key: [u8; 4] = rand::random();
                self.mask = Some(key);
                key
            }
        };
        crate::mask::apply_mask(&mut self.payload, key);
    }

    /// Reverses the masking applied by the peer, consuming the stored key.
    pub(crate) fn unmask_payload(&mut self) {
        if let Some(key) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_control_classification() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn opcode_byte_round_trip() {
        for byte in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            assert_eq!(u8::from(OpCode::try_from(byte).unwrap()), byte);
        }
    }

    #[test]
    fn reserved_opcodes_are_rejected() {
        for byte in [0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(matches!(
                OpCode::try_from(byte),
                Err(WebSocketError::InvalidOpCode(b)) if b == byte
            ));
        }
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let frame = Frame::close(CloseCode::Normal, "bye");
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        assert_eq!(frame.close_reason().unwrap(), Some("bye"));
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
    }

    #[test]
    fn close_frame_without_reason() {
        let frame = Frame::close(CloseCode::Away, []);
        assert_eq!(frame.payload.len(), 2);
        assert_eq!(frame.close_reason().unwrap(), None);
    }

    #[test]
    fn close_reason_must_be_utf8() {
        let frame = Frame::close_raw([0x03, 0xE8, 0xC0, 0x80]);
        assert!(matches!(
            frame.close_reason(),
            Err(WebSocketError::InvalidUtf8)
        ));
    }

    #[test]
    fn header_for_short_masked_text_frame() {
        let mut frame = Frame::text("Header test");
        frame.mask = Some([0xAA, 0xBB, 0xCC, 0xDD]);

        let mut head = [0u8; MAX_HEADER_SIZE];
        let size = frame.encode_header(&mut head);

        assert_eq!(size, 2 + 4);
        assert_eq!(head[0], 0x81); // FIN + text opcode
        assert_eq!(head[1], 0x80 | 11); // MASK bit + length 11
        assert_eq!(&head[2..6], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn header_length_encodings() {
        let mut head = [0u8; MAX_HEADER_SIZE];

        let frame = Frame::binary(vec![0u8; 125]);
        assert_eq!(frame.encode_header(&mut head), 2);
        assert_eq!(head[1], 125);

        let frame = Frame::binary(vec![0u8; 126]);
        assert_eq!(frame.encode_header(&mut head), 4);
        assert_eq!(head[1], 126);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 126);

        let frame = Frame::binary(vec![0u8; 65536]);
        assert_eq!(frame.encode_header(&mut head), 10);
        assert_eq!(head[1], 127);
        assert_eq!(
            u64::from_be_bytes(head[2..10].try_into().unwrap()),
            65536
        );
    }

    #[test]
    fn compressed_flag_sets_rsv1() {
        let mut frame = Frame::text("deflated");
        frame.compressed = true;
        let mut head = [0u8; MAX_HEADER_SIZE];
        frame.encode_header(&mut head);
        assert_eq!(head[0] & 0x40, 0x40);
    }

    #[test]
    fn mask_then_unmask_restores_payload() {
        let mut frame = Frame::binary(b"mask me".as_slice());
        let original = frame.payload.clone();

        frame.mask_payload();
        assert!(frame.mask.is_some());
        assert_ne!(frame.payload, original);

        frame.unmask_payload();
        assert_eq!(frame.payload, original);
        assert!(frame.mask.is_none());
    }
}
