//! # hpx-wsproto
//!
//! A WebSocket protocol engine: RFC 6455 framing plus the RFC 7692
//! `permessage-deflate` extension, usable in both the client and the server role.
//!
//! The engine owns exactly one connection's framing and compression state. The HTTP
//! upgrade exchange and the transport itself stay outside: the caller performs the
//! upgrade, hands the extension header text to a [`Handshake`], and then gives the
//! live byte stream to [`Handshake::open`].
//!
//! ## Components
//!
//! - [`codec`]: frame encoding and decoding over a streaming read buffer.
//! - [`compression`]: the per-direction deflate/inflate contexts.
//! - [`assembler`]: reassembly of fragmented frames into [`Message`]s.
//! - [`extensions`]: `Sec-WebSocket-Extensions` parsing and negotiation.
//! - [`Connection`]: the state machine tying everything together.
//! - [`ConnectionRegistry`]: a server-wide map of live connections.
//!
//! ## Example
//!
//! ```no_run
//! use hpx_wsproto::{Config, DeflateConfig, Handshake, SendOptions};
//! use tokio::net::TcpStream;
//!
//! # async fn run(stream: TcpStream, offered: Option<&str>) -> hpx_wsproto::Result<()> {
//! let config = Config::builder()
//!     .permessage_deflate(DeflateConfig::default())
//!     .build()?;
//!
//! let mut handshake = Handshake::server(config);
//! let _response_header = handshake.accept_offer(offered)?;
//! // ... write the HTTP 101 response carrying the header ...
//!
//! let mut conn = handshake.open(stream);
//! while let Some(message) = conn.receive().await? {
//!     conn.send(message.payload().clone(), SendOptions::from(message.kind()))
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod close;
pub mod codec;
pub mod compression;
pub mod config;
mod connection;
pub mod extensions;
pub mod frame;
mod handshake;
#[doc(hidden)]
pub mod mask;
mod registry;

pub use assembler::{Message, MessageAssembler, MessageKind};
pub use close::{CloseCode, CloseFrame};
pub use codec::{Decoded, Decoder, Encoder, Role};
pub use compression::CompressionContext;
pub use config::{
    Config, ConfigBuilder, ConnectionOverrides, DeflateConfig, NegotiationMode, SendPolicy,
};
pub use connection::{Connection, ConnectionId, Event, Receiver, SendOptions, Sender, State};
pub use extensions::{ExtensionNegotiator, ExtensionParams};
pub use frame::{Frame, OpCode};
pub use handshake::{Handshake, accept_key, generate_key};
pub use registry::ConnectionRegistry;
use thiserror::Error;

/// Result type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Malformed frame, illegal frame ordering or illegal mask usage.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolError),

    /// Text payload or close reason is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Frame or assembled message exceeds the configured maximum.
    #[error("Message too big ({size} bytes, limit {limit})")]
    MessageTooBig {
        /// Size that was observed, or the running total when the limit was crossed.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Compressed payload could not be inflated.
    #[error("Decompression failure: {0}")]
    DecompressionFailure(String),

    /// The transport failed. No close frame can be sent after this.
    #[error(transparent)]
    Transport(#[from] std::io::Error),

    /// Extension parameters could not be agreed on.
    #[error("Extension negotiation mismatch: {0}")]
    NegotiationMismatch(String),

    /// A configuration value was rejected when the configuration was built.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Handshake input the engine cannot work with.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(&'static str),

    /// Connection has been closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The send queue is at its configured bound.
    #[error("Send queue is full")]
    SendQueueFull,
}

/// Reason carried by [`WebSocketError::ProtocolViolation`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Opcode is reserved or unknown.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// RSV2 or RSV3 set; no extension defining them is supported.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// RSV1 set although no compression was negotiated.
    #[error("compressed frame on a connection without compression")]
    CompressionNotNegotiated,

    /// RSV1 set on a continuation frame.
    #[error("RSV1 set on a continuation frame")]
    CompressedContinuation,

    /// RSV1 set on a control frame.
    #[error("RSV1 set on a control frame")]
    CompressedControlFrame,

    /// Extended payload length not in its shortest form, or the 64-bit MSB is set.
    #[error("payload length is not minimally encoded")]
    NonMinimalLength,

    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// Control frame without FIN.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Client frame without a mask.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// Server frame with a mask.
    #[error("server frame is masked")]
    MaskedFrame,

    /// Continuation frame with no message in progress.
    #[error("continuation frame without an initial frame")]
    UnexpectedContinuation,

    /// Control frame handed to the message assembler.
    #[error("control frame passed to the message assembler")]
    UnexpectedControlFrame,

    /// New data frame while a fragmented message is still open.
    #[error("new message started before the previous one finished")]
    InterleavedMessage,

    /// Close payload of one byte.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// Close code that may not appear on the wire.
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
}

impl WebSocketError {
    /// Close code a connection sends when tearing down because of this error.
    ///
    /// `None` means no close frame is attempted.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::ProtocolViolation(_) => Some(CloseCode::Protocol),
            Self::InvalidUTF8 | Self::DecompressionFailure(_) => Some(CloseCode::Invalid),
            Self::MessageTooBig { .. } => Some(CloseCode::Size),
            _ => None,
        }
    }

    /// Returns `true` if the error tears the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::InvalidUTF8
                | Self::MessageTooBig { .. }
                | Self::DecompressionFailure(_)
                | Self::Transport(_)
        )
    }

    /// Returns `true` if this is a protocol-level error (RFC 6455 violation).
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }

    /// Returns `true` if the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Returns the underlying I/O error, if any.
    pub fn as_io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        let violation = WebSocketError::from(ProtocolError::UnmaskedFrame);
        assert_eq!(violation.close_code(), Some(CloseCode::Protocol));
        assert_eq!(
            WebSocketError::InvalidUTF8.close_code(),
            Some(CloseCode::Invalid)
        );
        assert_eq!(
            WebSocketError::DecompressionFailure("bad block".into()).close_code(),
            Some(CloseCode::Invalid)
        );
        assert_eq!(
            WebSocketError::MessageTooBig { size: 2, limit: 1 }.close_code(),
            Some(CloseCode::Size)
        );

        let io = WebSocketError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(io.close_code(), None);
        assert!(io.is_fatal());
        assert!(io.as_io_error().is_some());
    }

    #[test]
    fn test_negotiation_errors_are_not_fatal_to_a_connection() {
        let err = WebSocketError::NegotiationMismatch("client_max_window_bits=8".into());
        assert!(!err.is_fatal());
        assert_eq!(err.close_code(), None);
    }
}
