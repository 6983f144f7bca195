//! Close status codes for the WebSocket close handshake.
//!
//! Defined in [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).

use self::CloseCode::*;

/// Status code carried in a close frame, describing why the connection is
/// being closed.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// 1000: normal closure, the purpose of the connection was fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: a protocol violation was detected.
    Protocol,
    /// 1003: a data type the endpoint cannot accept was received.
    Unsupported,
    /// 1005: no status code was present in the close frame. Never sent on
    /// the wire.
    Status,
    /// 1006: the connection dropped without a close frame. Never sent on
    /// the wire.
    Abnormal,
    /// 1007: a message payload was inconsistent with its type, e.g. invalid
    /// UTF-8 in a text message or a failed decompression.
    Invalid,
    /// 1008: a policy violation with no more specific code.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: the server hit an unexpected internal condition.
    Error,
    /// 1012: the server is restarting; the client may reconnect.
    Restart,
    /// 1013: the server is overloaded; try again later or elsewhere.
    Again,
    #[doc(hidden)]
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    #[doc(hidden)]
    Reserved(u16),
    #[doc(hidden)]
    Iana(u16),
    #[doc(hidden)]
    Library(u16),
    #[doc(hidden)]
    Bad(u16),
}

impl CloseCode {
    /// Whether this code may legitimately appear in a close frame received
    /// from the peer.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Bad(_) | Reserved(_) | Status | Abnormal | Tls)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1015 => Tls,
            1..=999 => Bad(code),
            1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            Tls => 1015,
            Reserved(code) => code,
            Iana(code) => code,
            Library(code) => code,
            Bad(code) => code,
        }
    }
}
