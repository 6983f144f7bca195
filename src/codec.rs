//! Frame-level codec.
//!
//! [`FrameCodec`] plugs into `tokio_util`'s [`Framed`] machinery and is the
//! lowest layer of the stack: it turns bytes into [`Frame`]s and back,
//! enforcing the header invariants that can be checked without message
//! context (reserved bits, opcode validity, control-frame shape, masking
//! direction, payload caps). Fragment sequencing and compression are
//! handled a layer up.
//!
//! [`Framed`]: tokio_util::codec::Framed

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE},
    WebSocketError,
};

/// Which side of the connection this codec serves.
///
/// Clients mask every outbound frame with a fresh random key and reject
/// masked inbound frames; servers do the opposite.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Partially decoded header, kept across `decode` calls while the buffer
/// fills.
struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Bytes of extended payload length still to read (0, 2 or 8).
    extra_len: usize,
    /// 7-bit length field from the second header byte.
    length_code: u8,
}

/// Decoder state between calls.
enum ReadState {
    /// Waiting for the 2 fixed header bytes.
    Start,
    /// Waiting for extended length and masking key.
    Head(Header),
    /// Waiting for `payload_len` payload bytes.
    Payload {
        header: Header,
        mask: Option<[u8; 4]>,
        payload_len: usize,
    },
}

/// Combined encoder/decoder for one connection.
pub struct FrameCodec {
    role: Role,
    state: ReadState,
    max_payload_read: usize,
}

impl FrameCodec {
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self {
            role,
            state: ReadState::Start,
            max_payload_read,
        }
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        loop {
            match std::mem::replace(&mut self.state, ReadState::Start) {
                ReadState::Start => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;
                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;

                    // Masking direction is fixed by the role: clients must
                    // mask, servers must not.
                    match self.role {
                        Role::Server if !masked => return Err(WebSocketError::UnmaskedFrame),
                        Role::Client if masked => return Err(WebSocketError::MaskedFrame),
                        _ => {}
                    }

                    let length_code = src[1] & 0x7F;
                    let extra_len = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    src.advance(2);

                    self.state = ReadState::Head(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        extra_len,
                        length_code,
                    });
                }
                ReadState::Head(header) => {
                    let head_len = header.extra_len + if header.masked { 4 } else { 0 };
                    if src.remaining() < head_len {
                        self.state = ReadState::Head(header);
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra_len {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => usize::try_from(src.get_u64())
                            .map_err(|_| WebSocketError::FrameTooLarge)?,
                        _ => unreachable!(),
                    };

                    let mask = header.masked.then(|| src.get_u32().to_be_bytes());

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_payload_read {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = ReadState::Payload {
                        header,
                        mask,
                        payload_len,
                    };
                }
                ReadState::Payload {
                    header,
                    mask,
                    payload_len,
                } => {
                    if src.remaining() < payload_len {
                        self.state = ReadState::Payload {
                            header,
                            mask,
                            payload_len,
                        };
                        return Ok(None);
                    }

                    let mut frame = Frame::new(header.fin, header.opcode, src.split_to(payload_len));
                    frame.compressed = header.rsv1;
                    frame.mask = mask;
                    frame.unmask_payload();

                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        if self.role == Role::Client {
            frame.mask_payload();
        }

        let mut head = [0u8; MAX_HEADER_SIZE];
        let head_len = frame.encode_header(&mut head);

        dst.reserve(head_len + frame.payload.len());
        dst.extend_from_slice(&head[..head_len]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    fn encode_as(role: Role, frame: Frame) -> BytesMut {
        let mut codec = FrameCodec::new(role, usize::MAX >> 1);
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    fn decode_as(role: Role, buf: &mut BytesMut) -> crate::Result<Option<Frame>> {
        FrameCodec::new(role, 2 * 1024 * 1024).decode(buf)
    }

    #[test]
    fn client_to_server_round_trip_across_length_encodings() {
        for opcode in [OpCode::Text, OpCode::Binary] {
            for size in [0usize, 1, 125, 126, 127, 65535, 65536, 1_000_000] {
                let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
                let frame = Frame::new(true, opcode, payload.as_slice());

                let mut wire = encode_as(Role::Client, frame);
                // The MASK bit must be set on every client frame.
                assert_eq!(wire[1] & 0x80, 0x80, "size={size}");

                let decoded = decode_as(Role::Server, &mut wire)
                    .unwrap()
                    .expect("complete frame");
                assert!(decoded.fin);
                assert_eq!(decoded.opcode, opcode);
                assert_eq!(&decoded.payload[..], &payload[..], "size={size}");
                assert!(wire.is_empty());
            }
        }
    }

    #[test]
    fn server_frames_are_not_masked() {
        let wire = encode_as(Role::Server, Frame::text("plain"));
        assert_eq!(wire[1] & 0x80, 0);
        assert_eq!(&wire[2..], b"plain");
    }

    #[test]
    fn server_rejects_unmasked_frames() {
        let mut wire = encode_as(Role::Server, Frame::text("nope"));
        assert!(matches!(
            decode_as(Role::Server, &mut wire),
            Err(WebSocketError::UnmaskedFrame)
        ));
    }

    #[test]
    fn client_rejects_masked_frames() {
        let mut wire = encode_as(Role::Client, Frame::text("nope"));
        assert!(matches!(
            decode_as(Role::Client, &mut wire),
            Err(WebSocketError::MaskedFrame)
        ));
    }

    #[test]
    fn partial_input_yields_none_until_complete() {
        let wire = encode_as(Role::Client, Frame::binary(vec![7u8; 300]));
        let mut codec = FrameCodec::new(Role::Server, 1024 * 1024);

        let mut buf = BytesMut::new();
        for chunk in wire.chunks(97) {
            buf.extend_from_slice(chunk);
        }
        // Feed one byte at a time through a fresh buffer to exercise every
        // intermediate state.
        let mut partial = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in buf.iter().enumerate() {
            partial.extend_from_slice(&[*byte]);
            if let Some(frame) = codec.decode(&mut partial).unwrap() {
                assert_eq!(i, buf.len() - 1);
                decoded = Some(frame);
            }
        }
        assert_eq!(decoded.unwrap().payload.len(), 300);
    }

    #[test]
    fn reserved_bits_fail_decoding() {
        let mut wire = encode_as(Role::Client, Frame::text("x"));
        wire[0] |= 0b0010_0000;
        assert!(matches!(
            decode_as(Role::Server, &mut wire),
            Err(WebSocketError::ReservedBitsNotZero)
        ));
    }

    #[test]
    fn fragmented_control_frame_is_rejected() {
        let mut wire = encode_as(Role::Client, Frame::ping("hb").with_fin(false));
        assert!(matches!(
            decode_as(Role::Server, &mut wire),
            Err(WebSocketError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn oversized_control_frame_is_rejected() {
        let mut wire = encode_as(Role::Client, Frame::ping(vec![0u8; 126]));
        assert!(matches!(
            decode_as(Role::Server, &mut wire),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut codec = FrameCodec::new(Role::Server, 64);
        let mut wire = encode_as(Role::Client, Frame::binary(vec![0u8; 65]));
        assert!(matches!(
            codec.decode(&mut wire),
            Err(WebSocketError::FrameTooLarge)
        ));
    }

    #[test]
    fn rsv1_surfaces_as_compressed() {
        let mut frame = Frame::text("deflated");
        frame.compressed = true;
        let mut wire = encode_as(Role::Client, frame);
        let decoded = decode_as(Role::Server, &mut wire).unwrap().unwrap();
        assert!(decoded.is_compressed());
    }
}
