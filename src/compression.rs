//! permessage-deflate support (RFC 7692).
//!
//! Two concerns live here:
//!
//! - [`DeflateParams`]: the four standard extension parameters as they
//!   appear in `Sec-WebSocket-Extensions`, with parsing, printing, and the
//!   server-side agreement logic used during the handshake.
//! - [`Deflater`] / [`Inflater`]: one raw-deflate stream per direction.
//!   Compression operates on whole messages: the compressor strips the
//!   trailing `0x00 0x00 0xFF 0xFF` sync marker from its output and the
//!   decompressor re-appends it before inflating, per RFC 7692
//!   Section 7.2. When `no_context_takeover` was negotiated for a
//!   direction, that stream resets its dictionary before every message.

use std::io;

use flate2::{Compression, FlushCompress, FlushDecompress, Status};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

const EXTENSION_NAME: &str = "permessage-deflate";

/// Sync marker ending every deflate block flushed with `Z_SYNC_FLUSH`.
const SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Output capacity added whenever a stream call runs out of room.
const OUTPUT_STEP: usize = 4096;

/// The permessage-deflate parameters of one side's extension offer or the
/// agreed configuration echoed by a server.
///
/// Window-bit fields distinguish "parameter absent" (`None`) from
/// "parameter present without a value" (`Some(None)`), which RFC 7692
/// permits for `client_max_window_bits` in offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<Option<u8>>,
    pub client_max_window_bits: Option<Option<u8>>,
}

impl DeflateParams {
    fn parse(input: &str) -> Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut params = Self::default();
        let (mut remaining, _) = tag(EXTENSION_NAME)(input)?;

        while !remaining.is_empty() {
            let (rest, (key, value)) = Self::parse_param(remaining)?;
            match key {
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                "server_max_window_bits" => {
                    params.server_max_window_bits = Some(value.and_then(|v| v.parse().ok()));
                }
                "client_max_window_bits" => {
                    params.client_max_window_bits = Some(value.and_then(|v| v.parse().ok()));
                }
                // Unknown parameters are ignored rather than rejected.
                _ => {}
            }
            remaining = rest;
        }

        Ok(params)
    }

    /// One `; key[=value]` element.
    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            tag(";"),
            preceded(
                space0,
                pair(
                    take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                    opt(preceded(tag("="), digit1)),
                ),
            ),
        )(input)
    }
}

impl std::str::FromStr for DeflateParams {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input).map_err(|err| err.to_string())
    }
}

impl std::fmt::Display for DeflateParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{EXTENSION_NAME}")?;

        if let Some(bits) = self.server_max_window_bits {
            match bits {
                Some(bits) if (9..16).contains(&bits) => {
                    write!(f, "; server_max_window_bits={bits}")?
                }
                _ => write!(f, "; server_max_window_bits")?,
            }
        }
        if let Some(bits) = self.client_max_window_bits {
            match bits {
                Some(bits) if (9..16).contains(&bits) => {
                    write!(f, "; client_max_window_bits={bits}")?
                }
                _ => write!(f, "; client_max_window_bits")?,
            }
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        Ok(())
    }
}

/// Error for a stream the peer (or our own state) has wedged.
fn stream_error(direction: &str, detail: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{direction} stream is broken: {detail}"),
    )
}

/// Outbound deflate stream for one direction of a connection.
pub struct Deflater {
    /// Reset the dictionary before each message (`no_context_takeover`).
    reset_per_message: bool,
    stream: flate2::Compress,
}

impl Deflater {
    pub fn new(level: Compression, reset_per_message: bool) -> Self {
        Self {
            reset_per_message,
            // `false`: raw deflate without a zlib header, as RFC 7692 requires.
            stream: flate2::Compress::new(level, false),
        }
    }

    /// Compresses one complete message, returning its payload with the
    /// trailing sync marker stripped.
    ///
    /// One loop drives the whole message: plain compression while input
    /// remains, then a sync flush until the stream has nothing left to
    /// say. `compress_vec` appends into the output's spare capacity, so
    /// the loop only has to keep that capacity topped up.
    pub fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        if self.reset_per_message {
            self.stream.reset();
        }

        let mut output = Vec::with_capacity(OUTPUT_STEP);
        let mut fed = 0;
        loop {
            if output.capacity() == output.len() {
                output.reserve(OUTPUT_STEP);
            }

            // Flush only once all input has been handed over; flushing
            // earlier would scatter sync markers through the message.
            let flushing = fed >= input.len();
            let flush = if flushing {
                FlushCompress::Sync
            } else {
                FlushCompress::None
            };

            let fed_before = self.stream.total_in();
            let made_before = self.stream.total_out();
            let status = self
                .stream
                .compress_vec(&input[fed..], &mut output, flush)
                .map_err(|err| stream_error("deflate", err))?;
            fed += (self.stream.total_in() - fed_before) as usize;
            let made_nothing = self.stream.total_out() == made_before;

            // Done only when a flushing call had nothing left to emit; a
            // plain call may consume everything yet keep it all buffered.
            if (flushing && made_nothing) || matches!(status, Status::StreamEnd) {
                break;
            }
        }

        if output.ends_with(&SYNC_TRAILER) {
            output.truncate(output.len() - SYNC_TRAILER.len());
        }
        Ok(output)
    }
}

/// Inbound inflate stream for one direction of a connection.
pub struct Inflater {
    reset_per_message: bool,
    stream: flate2::Decompress,
}

impl Inflater {
    pub fn new(reset_per_message: bool) -> Self {
        Self {
            reset_per_message,
            stream: flate2::Decompress::new(false),
        }
    }

    /// Decompresses one complete message payload (fragments already
    /// concatenated), re-appending the sync trailer the sender stripped.
    pub fn decompress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        if self.reset_per_message {
            self.stream.reset(false);
        }

        let mut output =
            Vec::with_capacity(input.len().saturating_mul(2).clamp(OUTPUT_STEP, 1 << 20));
        self.inflate_all(input, &mut output)?;
        self.inflate_all(&SYNC_TRAILER, &mut output)?;
        Ok(output)
    }

    /// Feeds `input` to completion, growing `output` as needed. The same
    /// drive-until-quiet loop as the compressor, minus the flush split:
    /// inflate emits everything it can on each call.
    fn inflate_all(&mut self, input: &[u8], output: &mut Vec<u8>) -> io::Result<()> {
        let mut fed = 0;
        loop {
            if output.capacity() == output.len() {
                output.reserve(OUTPUT_STEP);
            }

            let fed_before = self.stream.total_in();
            let made_before = self.stream.total_out();
            let status = self
                .stream
                .decompress_vec(&input[fed..], output, FlushDecompress::None)
                .map_err(|err| stream_error("inflate", err))?;
            fed += (self.stream.total_in() - fed_before) as usize;
            let made_nothing = self.stream.total_out() == made_before;

            let drained = fed == input.len() && made_nothing;
            if drained || matches!(status, Status::StreamEnd) {
                break Ok(());
            }
        }
    }
}
