//! # codec
//!
//! Frame encoding and decoding, the lowest layer of the engine.
//!
//! The codec parses raw bytes into [`Frame`]s and serializes frames back, including
//! header validation, the three payload length forms and masking. It knows nothing
//! about messages: fragment reassembly, decompression and UTF-8 validation happen in
//! [`crate::assembler`], control-frame handling in the connection.
//!
//! Two entry points share the same header rules:
//!
//! - [`Decoder::decode_slice`] / [`Encoder::encode_frame`] work on plain buffers and
//!   report how many bytes a frame used, or [`Decoded::NeedMoreData`].
//! - The [`tokio_util::codec`] implementations drive `FramedRead` / `FramedWrite`
//!   over a live transport.
//!
//! ```text
//! Network bytes → Decoder → Frame(Text, RSV1=1, FIN=0)
//! Network bytes → Decoder → Frame(Continuation, RSV1=0, FIN=0)
//! Network bytes → Decoder → Frame(Continuation, RSV1=0, FIN=1)
//!        ↓
//! MessageAssembler joins the payloads and inflates once
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec;

use crate::{
    ProtocolError, Result, WebSocketError,
    frame::{Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE, OpCode},
    mask::apply_mask,
};

/// The role the endpoint is taking.
///
/// A client masks every frame it sends and rejects masked frames; a server does the
/// opposite.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
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

/// Outcome of [`Decoder::decode_slice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of input bytes it occupied.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds a valid prefix of a frame but not the whole frame.
    NeedMoreData,
}

/// Parsed and validated frame header.
#[derive(Debug, Clone, Copy)]
struct Head {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

/// Frame decoder for one endpoint.
///
/// Validation happens as soon as the header is complete, so a malformed frame is
/// rejected without waiting for its payload.
#[derive(Debug, Clone)]
pub struct Decoder {
    role: Role,
    max_frame_size: usize,
    compression: bool,
}

impl Decoder {
    /// Creates a decoder for `role` that rejects payloads above `max_frame_size`.
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
            compression: false,
        }
    }

    /// Accepts RSV1 on initial data frames. Only set after permessage-deflate has
    /// been negotiated.
    #[must_use]
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Decodes one frame from the start of `buf`.
    pub fn decode_slice(&self, buf: &[u8]) -> Result<Decoded> {
        let Some(head) = self.parse_head(buf)? else {
            return Ok(Decoded::NeedMoreData);
        };
        let total = head.header_len + head.payload_len;
        if buf.len() < total {
            return Ok(Decoded::NeedMoreData);
        }

        let mut payload = BytesMut::from(&buf[head.header_len..total]);
        let frame = head.into_frame(&mut payload);
        Ok(Decoded::Frame {
            frame,
            consumed: total,
        })
    }

    /// Parses the header at the start of `buf`, or `None` if it is incomplete.
    fn parse_head(&self, buf: &[u8]) -> Result<Option<Head>> {
        let &[b0, b1, ..] = buf else {
            return Ok(None);
        };

        let fin = b0 & 0b1000_0000 != 0;
        let rsv1 = b0 & 0b0100_0000 != 0;
        if b0 & 0b0011_0000 != 0 {
            return Err(ProtocolError::ReservedBitsNotZero.into());
        }
        let opcode = OpCode::try_from(b0 & 0b0000_1111)?;

        if rsv1 {
            if opcode.is_control() {
                return Err(ProtocolError::CompressedControlFrame.into());
            }
            if opcode == OpCode::Continuation {
                return Err(ProtocolError::CompressedContinuation.into());
            }
            if !self.compression {
                return Err(ProtocolError::CompressionNotNegotiated.into());
            }
        }

        let masked = b1 & 0b1000_0000 != 0;
        match (self.role, masked) {
            (Role::Server, false) => return Err(ProtocolError::UnmaskedFrame.into()),
            (Role::Client, true) => return Err(ProtocolError::MaskedFrame.into()),
            _ => {}
        }

        let length_code = b1 & 0x7F;
        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_len = 2 + extra + if masked { 4 } else { 0 };
        if buf.len() < header_len {
            return Ok(None);
        }

        let payload_len = match extra {
            0 => u64::from(length_code),
            2 => {
                let len = u64::from(u16::from_be_bytes([buf[2], buf[3]]));
                if len < 126 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                len
            }
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len <= u64::from(u16::MAX) || len >> 63 != 0 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                len
            }
        };

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::ControlFrameFragmented.into());
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::ControlFrameTooLarge.into());
            }
        }

        let payload_len = match usize::try_from(payload_len) {
            Ok(len) if len <= self.max_frame_size => len,
            _ => {
                return Err(WebSocketError::MessageTooBig {
                    size: usize::try_from(payload_len).unwrap_or(usize::MAX),
                    limit: self.max_frame_size,
                });
            }
        };

        let mask = masked.then(|| {
            let at = 2 + extra;
            [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
        });

        Ok(Some(Head {
            fin,
            rsv1,
            opcode,
            mask,
            header_len,
            payload_len,
        }))
    }
}

impl Head {
    /// Builds the frame, unmasking `payload` in place.
    fn into_frame(self, payload: &mut BytesMut) -> Frame {
        if let Some(mask) = self.mask {
            apply_mask(payload, mask);
        }
        let payload = payload.split().freeze();
        Frame::new(self.fin, self.opcode, None, payload).with_rsv1(self.rsv1)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(head) = self.parse_head(src)? else {
            return Ok(None);
        };

        let total = head.header_len + head.payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(head.header_len);
        let mut payload = src.split_to(head.payload_len);
        let frame = head.into_frame(&mut payload);
        tracing::trace!(
            opcode = ?frame.opcode,
            fin = frame.fin,
            rsv1 = frame.rsv1,
            len = frame.payload.len(),
            "decoded frame"
        );
        Ok(Some(frame))
    }
}

/// Frame encoder for one endpoint.
///
/// In the client role every frame is masked, with a fresh random key unless the frame
/// already carries one. In the server role any mask is dropped.
#[derive(Debug, Clone)]
pub struct Encoder {
    role: Role,
    max_frame_size: usize,
}

impl Encoder {
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
        }
    }

    /// Serializes `frame` into a standalone buffer.
    pub fn encode_frame(&self, frame: Frame) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode_into(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    fn encode_into(&self, mut frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let payload_len = frame.payload.len();
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(ProtocolError::ControlFrameFragmented.into());
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge.into());
            }
        }
        if payload_len > self.max_frame_size {
            return Err(WebSocketError::MessageTooBig {
                size: payload_len,
                limit: self.max_frame_size,
            });
        }

        frame.mask = match self.role {
            Role::Client => Some(frame.mask.unwrap_or_else(rand::random)),
            Role::Server => None,
        };

        dst.reserve(MAX_HEAD_SIZE + payload_len);
        frame.write_head(dst);

        let index = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = frame.mask {
            apply_mask(&mut dst[index..], mask);
        }

        tracing::trace!(
            opcode = ?frame.opcode,
            fin = frame.fin,
            rsv1 = frame.rsv1,
            len = payload_len,
            "encoded frame"
        );
        Ok(())
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encode_into(frame, dst)
    }
}
