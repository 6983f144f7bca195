//! Read and write halves of the protocol core.
//!
//! Both halves are sans-io: they are driven with a frame `Stream`/`Sink`
//! (the `Framed` transport) supplied on every call, which keeps them
//! independent of the socket type and directly testable.
//!
//! The read half assembles fragmented messages and decompresses complete
//! ones; control frames pass through immediately and never disturb an
//! in-progress fragment sequence. The write half compresses whole messages,
//! fragments oversized ones, and runs the close-side state machine.

use std::{
    task::{ready, Context, Poll},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures::SinkExt;

use crate::{
    close::CloseCode,
    codec::Role,
    compression::{Deflater, Inflater},
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    Result, WebSocketError,
};

use super::Negotiation;

// ================ ReadHalf ====================

/// One step of inbound progress.
pub(crate) enum ReadStep {
    /// A complete message or control frame.
    Complete(Frame),
    /// A fragment was consumed into the reassembly buffer; the message is
    /// not finished yet.
    Partial,
}

/// Inbound side: fragment reassembly, limits, decompression.
pub(crate) struct ReadHalf {
    inflater: Option<Inflater>,
    fragment: Option<Fragment>,
    accumulated: BytesMut,
    max_read_buffer: usize,
    fragment_timeout: Option<Duration>,
    pub(crate) is_closed: bool,
}

/// Header of the in-progress fragmented message.
struct Fragment {
    started: Instant,
    opcode: OpCode,
    compressed: bool,
}

impl ReadHalf {
    pub(crate) fn new(role: Role, negotiation: &Negotiation) -> Self {
        Self {
            inflater: negotiation.inflater(role),
            fragment: None,
            accumulated: BytesMut::with_capacity(1024),
            max_read_buffer: negotiation.max_read_buffer,
            fragment_timeout: negotiation.fragment_timeout,
            is_closed: false,
        }
    }

    /// Advances message assembly with one decoded frame.
    ///
    /// Returns `Ok(None)` while a fragmented message is still incomplete;
    /// control frames always complete immediately.
    fn on_frame(&mut self, mut frame: Frame) -> Result<Option<Frame>> {
        if frame.is_compressed() && self.inflater.is_none() {
            return Err(WebSocketError::CompressionNotSupported);
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                if !frame.fin {
                    self.fragment = Some(Fragment {
                        started: Instant::now(),
                        opcode: frame.opcode,
                        compressed: frame.is_compressed(),
                    });
                    self.accumulated.extend_from_slice(&frame.payload);
                    Ok(None)
                } else {
                    if frame.is_compressed() {
                        self.inflate_into(&mut frame);
                    }
                    Ok(Some(frame))
                }
            }
            OpCode::Continuation => {
                let fragment = self
                    .fragment
                    .as_ref()
                    .ok_or(WebSocketError::InvalidContinuationFrame)?;

                // A continuation must not restate RSV1; only the opening
                // frame carries the compression bit.
                if frame.is_compressed() {
                    return Err(WebSocketError::ReservedBitsNotZero);
                }

                if self.accumulated.len() + frame.payload.len() > self.max_read_buffer {
                    return Err(WebSocketError::FrameTooLarge);
                }
                self.accumulated.extend_from_slice(&frame.payload);

                if frame.fin {
                    // Swap in a fresh buffer so one huge message does not
                    // pin its capacity for the connection lifetime.
                    let payload =
                        std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));

                    frame.opcode = fragment.opcode;
                    frame.compressed = fragment.compressed;
                    frame.payload = payload;
                    self.fragment = None;

                    if frame.is_compressed() {
                        self.inflate_into(&mut frame);
                    }
                    Ok(Some(frame))
                } else if self
                    .fragment_timeout
                    .is_some_and(|timeout| fragment.started.elapsed() > timeout)
                {
                    Err(WebSocketError::FragmentTimeout)
                } else {
                    Ok(None)
                }
            }
            // Control frames interleave freely with fragments; the codec
            // already enforced FIN and the payload cap.
            _ => {
                if frame.opcode == OpCode::Close {
                    self.is_closed = true;
                }
                Ok(Some(frame))
            }
        }
    }

    /// Inflates a complete message in place. On failure the raw payload is
    /// kept and the frame is flagged; the caller closes with 1007.
    fn inflate_into(&mut self, frame: &mut Frame) {
        let inflater = self.inflater.as_mut().expect("checked on entry");
        match inflater.decompress(&frame.payload) {
            Ok(payload) => {
                frame.payload = BytesMut::from(&payload[..]);
                frame.compressed = false;
            }
            Err(err) => {
                log::warn!("inbound message failed to inflate: {err}");
                frame.decompression_failed = true;
            }
        }
    }

    /// Polls the framed transport for one step of progress: a complete
    /// message/control frame, or notice that a fragment was absorbed.
    pub(crate) fn poll_step<S>(
        &mut self,
        stream: &mut S,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ReadStep>>
    where
        S: futures::Stream<Item = Result<Frame>> + Unpin,
    {
        use futures::StreamExt;

        if !self.is_closed {
            let frame = match ready!(stream.poll_next_unpin(cx)) {
                Some(frame) => frame?,
                None => {
                    self.is_closed = true;
                    return Poll::Ready(Err(WebSocketError::ConnectionClosed));
                }
            };

            return match self.on_frame(frame)? {
                Some(frame) => Poll::Ready(Ok(ReadStep::Complete(frame))),
                None => Poll::Ready(Ok(ReadStep::Partial)),
            };
        }

        Poll::Ready(Err(WebSocketError::ConnectionClosed))
    }
}

// ================ WriteHalf ====================

/// Outbound side: compression, fragmentation, close sequencing.
///
/// The close sequence is tracked with two flags and a parked frame
/// instead of a state enum: `close_queued` records that a close frame has
/// reached the transport buffer (the application may have sent its own),
/// `pending_close` parks a generated close frame until the sink can take
/// it, and `shut_down` latches once the transport is gone.
pub(crate) struct WriteHalf {
    deflater: Option<Deflater>,
    fragment_size: Option<usize>,
    /// A close frame has been handed to the transport buffer.
    close_queued: bool,
    /// Close frame built by `poll_close` that the sink could not yet
    /// accept.
    pending_close: Option<Frame>,
    /// The transport shutdown completed; nothing can be written anymore.
    shut_down: bool,
}

impl WriteHalf {
    pub(crate) fn new(role: Role, negotiation: &Negotiation) -> Self {
        Self {
            deflater: negotiation.deflater(role),
            fragment_size: negotiation.fragment_size,
            close_queued: false,
            pending_close: None,
            shut_down: false,
        }
    }

    /// Whether a close frame has already been queued on this side.
    pub(crate) fn close_sent(&self) -> bool {
        self.close_queued || self.pending_close.is_some()
    }

    pub(crate) fn poll_ready<S>(&mut self, stream: &mut S, cx: &mut Context<'_>) -> Poll<Result<()>>
    where
        S: futures::Sink<Frame, Error = WebSocketError> + Unpin,
    {
        if self.shut_down {
            return Poll::Ready(Err(WebSocketError::ConnectionClosed));
        }
        stream.poll_ready_unpin(cx)
    }

    /// Queues one application frame (or, for oversized messages, the
    /// fragment train it expands to) on the transport.
    pub(crate) fn start_send<S>(&mut self, stream: &mut S, frame: Frame) -> Result<()>
    where
        S: futures::Sink<Frame, Error = WebSocketError> + Unpin,
    {
        if frame.opcode.is_control() {
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
            if frame.opcode == OpCode::Close {
                self.close_queued = true;
            }
            return stream.start_send_unpin(frame);
        }

        // Only complete data messages are compressed; manual fragments go
        // out untouched (RFC 7692 sets RSV1 on the opening frame only, and
        // the whole message must be compressed as a unit).
        let whole_message = frame.fin
            && matches!(frame.opcode, OpCode::Text | OpCode::Binary);

        let frame = if whole_message {
            if let Some(deflater) = self.deflater.as_mut() {
                let payload = deflater
                    .compress(&frame.payload)
                    .map_err(|err| WebSocketError::Decompression(err.to_string()))?;
                let mut compressed = Frame::new(true, frame.opcode, payload.as_slice());
                compressed.compressed = true;
                compressed
            } else {
                frame
            }
        } else {
            frame
        };

        match self.fragment_size {
            Some(cap) if whole_message && frame.payload.len() > cap => {
                self.send_fragmented(stream, frame, cap)
            }
            _ => stream.start_send_unpin(frame),
        }
    }

    /// Splits `frame` into a train of fragments of at most `cap` payload
    /// bytes. The frames are queued back to back on the transport buffer,
    /// so no other frame can interleave the train.
    fn send_fragmented<S>(&mut self, stream: &mut S, frame: Frame, cap: usize) -> Result<()>
    where
        S: futures::Sink<Frame, Error = WebSocketError> + Unpin,
    {
        let payload = frame.payload;
        let total = payload.len();
        let mut offset = 0;

        while offset < total {
            let end = (offset + cap).min(total);
            let last = end == total;

            let fragment = if offset == 0 {
                let mut first = Frame::new(last, frame.opcode, &payload[offset..end]);
                first.compressed = frame.compressed;
                first
            } else {
                Frame::new(last, OpCode::Continuation, &payload[offset..end])
            };

            stream.start_send_unpin(fragment)?;
            offset = end;
        }

        Ok(())
    }

    pub(crate) fn poll_flush<S>(&mut self, stream: &mut S, cx: &mut Context<'_>) -> Poll<Result<()>>
    where
        S: futures::Sink<Frame, Error = WebSocketError> + Unpin,
    {
        stream.poll_flush_unpin(cx)
    }

    /// Drives the close sequence to completion: make sure a close frame is
    /// on the wire, flush everything, then shut the transport down.
    ///
    /// Written as three straight-line phases guarded by the flags; a
    /// `Pending` at any point leaves the flags where they are, so the next
    /// poll resumes exactly where this one stopped.
    pub(crate) fn poll_close<S>(&mut self, stream: &mut S, cx: &mut Context<'_>) -> Poll<Result<()>>
    where
        S: futures::Sink<Frame, Error = WebSocketError> + Unpin,
    {
        if self.shut_down {
            return Poll::Ready(Ok(()));
        }

        // Phase 1: a close frame must exist and reach the transport
        // buffer. Skipped entirely when the application already sent one.
        if !self.close_queued {
            if self.pending_close.is_none() {
                self.pending_close = Some(Frame::close(CloseCode::Normal, []));
            }
            ready!(stream.poll_ready_unpin(cx))?;
            let frame = self.pending_close.take().expect("parked close frame");
            stream.start_send_unpin(frame)?;
            self.close_queued = true;
        }

        // Phase 2 and 3: drain the buffer, then close the sink. Re-running
        // an already-complete flush on a later poll is a no-op.
        ready!(stream.poll_flush_unpin(cx))?;
        ready!(stream.poll_close_unpin(cx))?;

        self.shut_down = true;
        Poll::Ready(Ok(()))
    }
}
