//! WebSocket frames as they appear on the wire.
//!
//! A [`Frame`] is one protocol unit: header bits plus a payload. Messages larger than
//! one frame travel as an initial text or binary frame followed by continuation
//! frames; see [`crate::assembler`] for the receiving side.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    ProtocolError, WebSocketError,
    close::{CloseCode, CloseFrame},
};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible frame header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Operation code of a frame.
///
/// The numeric values are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that start a message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
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
            _ => Err(ProtocolError::InvalidOpCode(value).into()),
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
/// Use the constructors rather than building frames field by field:
///
/// ```rust
/// use hpx_wsproto::{CloseCode, Frame};
///
/// let text = Frame::text("Hello");
/// let first = Frame::binary(vec![1, 2, 3]).with_fin(false);
/// let ping = Frame::ping("are you there");
/// let close = Frame::close(CloseCode::Normal, "bye");
/// ```
///
/// `rsv1` marks a compressed message and is only meaningful on the first frame of a
/// message. The mask is filled in by the encoder for the client role; the decoder
/// removes it, so decoded frames always carry plaintext payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub(crate) fin: bool,
    pub(crate) rsv1: bool,
    pub(crate) rsv2: bool,
    pub(crate) rsv3: bool,
    pub(crate) opcode: OpCode,
    pub(crate) mask: Option<[u8; 4]>,
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Creates a frame with all reserved bits cleared.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// A final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// A continuation frame, final by default.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// A close frame carrying `code` and `reason`.
    ///
    /// The reason is truncated so the payload fits in a control frame.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::new(
            true,
            OpCode::Close,
            None,
            CloseFrame::new(code, reason).to_payload(),
        )
    }

    /// A close frame with an empty payload.
    pub fn close_empty() -> Self {
        Self::new(true, OpCode::Close, None, Bytes::new())
    }

    #[must_use]
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets RSV1, the permessage-deflate "compressed" marker.
    #[must_use]
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Returns `true` if RSV1 is set.
    pub fn is_compressed(&self) -> bool {
        self.rsv1
    }

    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Splits a message frame into fragments of at most `max_size` payload bytes.
    ///
    /// The first fragment keeps the opcode and RSV1; the rest are continuation
    /// frames. Only the last fragment has FIN set. A frame that already fits is
    /// returned unchanged.
    pub(crate) fn into_fragments(self, max_size: usize) -> Fragments {
        Fragments {
            first: true,
            max_size: max_size.max(1),
            rest: Some(self),
        }
    }

    /// Writes the header (without payload) into `dst`.
    pub(crate) fn write_head(&self, dst: &mut BytesMut) {
        let first_byte = u8::from(self.fin) << 7
            | u8::from(self.rsv1) << 6
            | u8::from(self.rsv2) << 5
            | u8::from(self.rsv3) << 4
            | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        dst.put_u8(first_byte);
        if len < 126 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len <= u16::MAX as usize {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

/// Iterator returned by [`Frame::into_fragments`].
pub(crate) struct Fragments {
    first: bool,
    max_size: usize,
    rest: Option<Frame>,
}

impl Iterator for Fragments {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let mut frame = self.rest.take()?;
        let first = std::mem::replace(&mut self.first, false);

        if frame.payload.len() <= self.max_size {
            if !first {
                frame.opcode = OpCode::Continuation;
                frame.rsv1 = false;
            }
            return Some(frame);
        }

        let chunk = frame.payload.split_to(self.max_size);
        let mut head = Frame::new(
            false,
            if first { frame.opcode } else { OpCode::Continuation },
            frame.mask,
            chunk,
        );
        head.rsv1 = first && frame.rsv1;
        self.rest = Some(frame);
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_classes() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Continuation.is_control());
        assert!(OpCode::Text.is_data());
        assert!(!OpCode::Continuation.is_data());
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        for byte in (0x3..=0x7).chain(0xB..=0xF) {
            assert!(matches!(
                OpCode::try_from(byte),
                Err(WebSocketError::ProtocolViolation(ProtocolError::InvalidOpCode(b))) if b == byte
            ));
        }
    }

    #[test]
    fn test_write_head_length_forms() {
        let mut dst = BytesMut::new();
        Frame::binary(vec![0u8; 125]).write_head(&mut dst);
        assert_eq!(&dst[..], &[0x82, 125]);

        dst.clear();
        Frame::binary(vec![0u8; 126]).write_head(&mut dst);
        assert_eq!(&dst[..], &[0x82, 126, 0, 126]);

        dst.clear();
        Frame::binary(vec![0u8; 65536]).write_head(&mut dst);
        assert_eq!(&dst[..], &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_write_head_flags_and_mask() {
        let mut dst = BytesMut::new();
        Frame::text("hi")
            .with_fin(false)
            .with_rsv1(true)
            .with_mask([1, 2, 3, 4])
            .write_head(&mut dst);
        assert_eq!(&dst[..], &[0x41, 0x82, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fragments_keep_rsv1_on_first_only() {
        let frames: Vec<Frame> = Frame::text("abcdefgh")
            .with_rsv1(true)
            .into_fragments(3)
            .collect();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert!(frames[0].rsv1 && !frames[0].fin);
        assert_eq!(frames[1].opcode, OpCode::Continuation);
        assert!(!frames[1].rsv1 && !frames[1].fin);
        assert_eq!(frames[2].opcode, OpCode::Continuation);
        assert!(!frames[2].rsv1 && frames[2].fin);

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, b"abcdefgh");
    }

    #[test]
    fn test_small_frame_is_not_fragmented() {
        let frames: Vec<Frame> = Frame::binary("abc").into_fragments(16).collect();
        assert_eq!(frames, vec![Frame::binary("abc")]);
    }
}
