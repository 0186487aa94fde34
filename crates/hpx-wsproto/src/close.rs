// The close code table follows the one in tungstenite-rs
// (https://github.com/snapview/tungstenite-rs), licensed under MIT and Apache 2.0.

//! Close codes and close frame payloads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{ProtocolError, Result, WebSocketError};

/// Status codes an endpoint sends when closing the connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: the peer violated the protocol.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: the connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007: payload inconsistent with the message type, e.g. bad UTF-8 or a
    /// corrupt compressed block.
    Invalid,
    /// 1008: generic policy violation.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: unexpected condition on the server.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: try again later.
    Again,
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
    /// Returns `true` if the code may appear in a close frame on the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Bad(_) | Self::Reserved(_) | Self::Status | Self::Abnormal | Self::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1015 => Self::Tls,
            1004 | 1014 | 1016..=2999 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Decoded payload of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code.
    pub code: CloseCode,
    /// UTF-8 reason, at most 123 bytes.
    pub reason: String,
}

impl CloseFrame {
    /// Largest reason that fits in a control frame next to the 2-byte code.
    pub const MAX_REASON_LEN: usize = 123;

    /// Creates a close payload, truncating the reason on a character boundary
    /// so the frame stays within the control frame limit.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > Self::MAX_REASON_LEN {
            let mut end = Self::MAX_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    /// Parses and validates a received close payload.
    ///
    /// An empty payload yields `None` (no status code). A single byte, a code
    /// that may not be sent on the wire or a reason that is not UTF-8 is an error.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload {
            [] => Ok(None),
            [_] => Err(ProtocolError::InvalidCloseFrame.into()),
            [hi, lo, reason @ ..] => {
                let raw = u16::from_be_bytes([*hi, *lo]);
                let code = CloseCode::from(raw);
                if !code.is_allowed() {
                    return Err(ProtocolError::InvalidCloseCode(raw).into());
                }
                let reason = std::str::from_utf8(reason)
                    .map_err(|_| WebSocketError::InvalidUTF8)?
                    .to_owned();
                Ok(Some(Self { code, reason }))
            }
        }
    }

    /// Serializes the payload: big-endian code followed by the reason.
    pub fn to_payload(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(self.code.into());
        payload.put_slice(self.reason.as_bytes());
        payload.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_round_trip() {
        for raw in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1011, 3000, 4999] {
            assert_eq!(u16::from(CloseCode::from(raw)), raw);
            assert!(CloseCode::from(raw).is_allowed(), "{raw} should be allowed");
        }
        for raw in [0u16, 999, 1004, 1005, 1006, 1015, 2000, 5000] {
            assert!(!CloseCode::from(raw).is_allowed(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_parse_close_payload() {
        assert_eq!(CloseFrame::parse(&[]).unwrap(), None);

        let frame = CloseFrame::new(CloseCode::Away, "bye");
        let parsed = CloseFrame::parse(&frame.to_payload()).unwrap();
        assert_eq!(parsed, Some(frame));
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert!(matches!(
            CloseFrame::parse(&[0x03]),
            Err(WebSocketError::ProtocolViolation(
                ProtocolError::InvalidCloseFrame
            ))
        ));
        assert!(matches!(
            CloseFrame::parse(&1005u16.to_be_bytes()),
            Err(WebSocketError::ProtocolViolation(
                ProtocolError::InvalidCloseCode(1005)
            ))
        ));
        assert!(matches!(
            CloseFrame::parse(&[0x03, 0xe8, 0xff, 0xfe]),
            Err(WebSocketError::InvalidUTF8)
        ));
    }

    #[test]
    fn test_reason_truncated_on_char_boundary() {
        let frame = CloseFrame::new(CloseCode::Normal, "é".repeat(100));
        assert!(frame.reason.len() <= CloseFrame::MAX_REASON_LEN);
        assert!(frame.to_payload().len() <= 125);
    }
}
