//! Reassembly of fragmented frames into messages.

use bytes::{Bytes, BytesMut};

use crate::{
    ProtocolError, Result, WebSocketError,
    compression::Decompressor,
    frame::{Frame, OpCode},
};

/// Kind of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A complete, decompressed data message.
///
/// Text messages are guaranteed to hold valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    payload: Bytes,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: Bytes::from(text.into()),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The payload as text, `None` for binary messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }
}

/// A message whose final frame has not arrived yet.
struct Partial {
    kind: MessageKind,
    compressed: bool,
    size: usize,
    chunks: Vec<Bytes>,
}

/// Joins data frames into [`Message`]s.
///
/// Holds at most one message in progress. Control frames are not part of any
/// message and must be handled before reaching the assembler.
pub struct MessageAssembler {
    partial: Option<Partial>,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partial: None,
            max_message_size,
        }
    }

    /// Returns `true` when no fragmented message is open.
    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Feeds one data frame. Control frames are refused; callers answer those
    /// themselves.
    ///
    /// Returns the message once its final frame arrives. A compressed message is
    /// inflated exactly once, over the joined payload of all its frames.
    pub fn push(
        &mut self,
        frame: Frame,
        inflate: Option<&mut Decompressor>,
    ) -> Result<Option<Message>> {
        let kind = match frame.opcode {
            OpCode::Text => MessageKind::Text,
            OpCode::Binary => MessageKind::Binary,
            OpCode::Continuation => return self.push_continuation(frame, inflate),
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                return Err(ProtocolError::UnexpectedControlFrame.into());
            }
        };

        if self.partial.is_some() {
            return Err(ProtocolError::InterleavedMessage.into());
        }
        if frame.rsv1 && inflate.is_none() {
            return Err(ProtocolError::CompressionNotNegotiated.into());
        }
        self.check_size(frame.payload.len())?;

        let partial = Partial {
            kind,
            compressed: frame.rsv1,
            size: frame.payload.len(),
            chunks: vec![frame.payload],
        };
        if frame.fin {
            Self::finish(partial, inflate).map(Some)
        } else {
            self.partial = Some(partial);
            Ok(None)
        }
    }

    fn push_continuation(
        &mut self,
        frame: Frame,
        inflate: Option<&mut Decompressor>,
    ) -> Result<Option<Message>> {
        let Some(partial) = self.partial.as_mut() else {
            return Err(ProtocolError::UnexpectedContinuation.into());
        };
        if frame.rsv1 {
            return Err(ProtocolError::CompressedContinuation.into());
        }

        let size = partial.size + frame.payload.len();
        if size > self.max_message_size {
            self.partial = None;
            return Err(WebSocketError::MessageTooBig {
                size,
                limit: self.max_message_size,
            });
        }
        partial.size = size;
        partial.chunks.push(frame.payload);

        if !frame.fin {
            return Ok(None);
        }
        match self.partial.take() {
            Some(partial) => Self::finish(partial, inflate).map(Some),
            None => Ok(None),
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            return Err(WebSocketError::MessageTooBig {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    fn finish(partial: Partial, inflate: Option<&mut Decompressor>) -> Result<Message> {
        let payload = if partial.chunks.len() == 1 {
            partial.chunks.into_iter().next().unwrap_or_default()
        } else {
            let mut joined = BytesMut::with_capacity(partial.size);
            for chunk in &partial.chunks {
                joined.extend_from_slice(chunk);
            }
            joined.freeze()
        };

        let payload = match (partial.compressed, inflate) {
            (true, Some(inflate)) => inflate.decompress(&payload)?,
            (true, None) => return Err(ProtocolError::CompressionNotNegotiated.into()),
            (false, _) => payload,
        };

        if partial.kind == MessageKind::Text && std::str::from_utf8(&payload).is_err() {
            return Err(WebSocketError::InvalidUTF8);
        }

        Ok(Message {
            kind: partial.kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use flate2::Compression;

    use super::*;
    use crate::compression::Compressor;

    const MAX: usize = 1 << 20;

    #[test]
    fn test_single_frame_message() {
        let mut assembler = MessageAssembler::new(MAX);
        let message = assembler.push(Frame::text("hello"), None).unwrap();
        assert_eq!(message, Some(Message::text("hello")));
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_control_frame_is_refused() {
        let mut assembler = MessageAssembler::new(MAX);
        assembler
            .push(Frame::text("par").with_fin(false), None)
            .unwrap();
        assert!(matches!(
            assembler.push(Frame::ping("x"), None),
            Err(WebSocketError::ProtocolViolation(
                ProtocolError::UnexpectedControlFrame
            ))
        ));
        // the open message is untouched
        assert_eq!(
            assembler.push(Frame::continuation("tial"), None).unwrap(),
            Some(Message::text("partial"))
        );
    }

    #[test]
    fn test_three_fragments_reassemble() {
        let mut assembler = MessageAssembler::new(MAX);
        assert_eq!(
            assembler
                .push(Frame::binary("ab").with_fin(false), None)
                .unwrap(),
            None
        );
        assert!(!assembler.is_idle());
        assert_eq!(
            assembler
                .push(Frame::continuation("cd").with_fin(false), None)
                .unwrap(),
            None
        );
        let message = assembler.push(Frame::continuation("ef"), None).unwrap();
        assert_eq!(message, Some(Message::binary("abcdef")));
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_compressed_fragments_inflate_once() {
        let original = b"fragmented and compressed, fragmented and compressed".repeat(8);
        let mut deflate = Compressor::new(Compression::default(), 15, false);
        let compressed = deflate.compress(&original).unwrap();
        assert!(compressed.len() >= 3);

        let third = compressed.len() / 3;
        let mut inflate = Decompressor::new(15, false, MAX);
        let mut assembler = MessageAssembler::new(MAX);

        let first = Frame::text(compressed.slice(..third))
            .with_rsv1(true)
            .with_fin(false);
        let second = Frame::continuation(compressed.slice(third..2 * third)).with_fin(false);
        let last = Frame::continuation(compressed.slice(2 * third..));

        assert!(assembler.push(first, Some(&mut inflate)).unwrap().is_none());
        assert!(assembler.push(second, Some(&mut inflate)).unwrap().is_none());
        let message = assembler.push(last, Some(&mut inflate)).unwrap().unwrap();
        assert_eq!(message.payload(), &original[..]);
        assert!(message.is_text());
    }

    #[test]
    fn test_ordering_violations() {
        let mut assembler = MessageAssembler::new(MAX);
        assert!(matches!(
            assembler.push(Frame::continuation("x"), None),
            Err(WebSocketError::ProtocolViolation(
                ProtocolError::UnexpectedContinuation
            ))
        ));

        assembler
            .push(Frame::text("a").with_fin(false), None)
            .unwrap();
        assert!(matches!(
            assembler.push(Frame::binary("b"), None),
            Err(WebSocketError::ProtocolViolation(
                ProtocolError::InterleavedMessage
            ))
        ));
    }

    #[test]
    fn test_rsv1_rules() {
        let mut assembler = MessageAssembler::new(MAX);
        assert!(matches!(
            assembler.push(Frame::binary("x").with_rsv1(true), None),
            Err(WebSocketError::ProtocolViolation(
                ProtocolError::CompressionNotNegotiated
            ))
        ));

        assembler
            .push(Frame::binary("a").with_fin(false), None)
            .unwrap();
        assert!(matches!(
            assembler.push(Frame::continuation("b").with_rsv1(true), None),
            Err(WebSocketError::ProtocolViolation(
                ProtocolError::CompressedContinuation
            ))
        ));
    }

    #[test]
    fn test_utf8_checked_on_whole_message() {
        let mut assembler = MessageAssembler::new(MAX);
        // "é" split across two frames
        assembler
            .push(Frame::text(&b"caf\xc3"[..]).with_fin(false), None)
            .unwrap();
        let message = assembler
            .push(Frame::continuation(&b"\xa9"[..]), None)
            .unwrap()
            .unwrap();
        assert_eq!(message.as_text(), Some("café"));

        assert!(matches!(
            assembler.push(Frame::text(&b"\xff\xfe"[..]), None),
            Err(WebSocketError::InvalidUTF8)
        ));
    }

    #[test]
    fn test_message_size_limit() {
        let mut assembler = MessageAssembler::new(4);
        assembler
            .push(Frame::binary("abc").with_fin(false), None)
            .unwrap();
        assert!(matches!(
            assembler.push(Frame::continuation("de"), None),
            Err(WebSocketError::MessageTooBig { size: 5, limit: 4 })
        ));
        assert!(matches!(
            assembler.push(Frame::binary("12345"), None),
            Err(WebSocketError::MessageTooBig { .. })
        ));
    }

    #[test]
    fn test_corrupt_compressed_message() {
        let mut inflate = Decompressor::new(15, false, MAX);
        let mut assembler = MessageAssembler::new(MAX);
        assert!(matches!(
            assembler.push(
                Frame::binary(vec![0xff, 0xff, 0xff]).with_rsv1(true),
                Some(&mut inflate)
            ),
            Err(WebSocketError::DecompressionFailure(_))
        ));
    }
}
