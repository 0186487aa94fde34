//! Per-message DEFLATE contexts (RFC 7692).
//!
//! A connection owns one [`Compressor`] for what it sends and one [`Decompressor`]
//! for what it receives. Each is bound to the window size negotiated for its
//! direction and either keeps its LZ77 dictionary between messages (context
//! takeover) or is recreated after every message.
//!
//! Payloads are compressed as raw DEFLATE ending in a sync flush. The flush always
//! ends in the empty stored block `00 00 ff ff`, which is stripped before sending
//! and appended again before inflating.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{Result, WebSocketError, codec::Role, extensions::ExtensionParams};

/// The empty stored block terminating every sync-flushed message.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Smallest window the DEFLATE backend can allocate.
///
/// An 8-bit window is legal on the wire; a 9-bit inflater decodes such a stream
/// unchanged, and outbound windows of 8 bits are never agreed to.
pub(crate) const MIN_BACKEND_WINDOW_BITS: u8 = 9;

/// Free space kept at the end of an output buffer before each backend call.
const CHUNK: usize = 1024;

/// Outbound DEFLATE context for one direction of a connection.
pub struct Compressor {
    deflate: Compress,
    level: Compression,
    window_bits: u8,
    no_context_takeover: bool,
}

impl Compressor {
    /// Creates a compressor for a negotiated window size.
    ///
    /// With `no_context_takeover` the context is recreated after every message.
    pub fn new(level: Compression, window_bits: u8, no_context_takeover: bool) -> Self {
        let window_bits = window_bits.clamp(MIN_BACKEND_WINDOW_BITS, 15);
        Self {
            deflate: Compress::new_with_window_bits(level, false, window_bits),
            level,
            window_bits,
            no_context_takeover,
        }
    }

    /// Window size the context was created with.
    pub fn window_bits(&self) -> u8 {
        self.window_bits
    }

    /// Compresses one complete message.
    ///
    /// The result is the payload of a frame with RSV1 set, trailer already removed.
    pub fn compress(&mut self, input: &[u8]) -> Result<Bytes> {
        let mut output = Vec::with_capacity(input.len() / 2 + CHUNK);

        let mut remaining = input;
        while !remaining.is_empty() {
            reserve(&mut output);
            let before_in = self.deflate.total_in();
            self.deflate
                .compress_vec(remaining, &mut output, FlushCompress::None)
                .map_err(deflate_error)?;
            let consumed = (self.deflate.total_in() - before_in) as usize;
            remaining = &remaining[consumed..];
        }

        // A sync flush is complete once a call returns with output space left over.
        loop {
            reserve(&mut output);
            self.deflate
                .compress_vec(&[], &mut output, FlushCompress::Sync)
                .map_err(deflate_error)?;
            if output.len() < output.capacity() {
                break;
            }
        }

        if !output.ends_with(&TRAILER) {
            return Err(deflate_error("sync flush did not end in an empty block"));
        }
        output.truncate(output.len() - TRAILER.len());
        if output.is_empty() {
            // RFC 7692 7.2.3.6: an empty message is sent as a single 0x00 byte.
            output.push(0x00);
        }

        if self.no_context_takeover {
            self.reset();
        }
        Ok(output.into())
    }

    fn reset(&mut self) {
        self.deflate = Compress::new_with_window_bits(self.level, false, self.window_bits);
    }
}

/// Inbound INFLATE context for one direction of a connection.
pub struct Decompressor {
    inflate: Decompress,
    window_bits: u8,
    no_context_takeover: bool,
    max_size: usize,
}

impl Decompressor {
    /// Creates a decompressor for a negotiated window size.
    ///
    /// `max_size` bounds the inflated size of a single message.
    pub fn new(window_bits: u8, no_context_takeover: bool, max_size: usize) -> Self {
        let window_bits = window_bits.clamp(MIN_BACKEND_WINDOW_BITS, 15);
        Self {
            inflate: Decompress::new_with_window_bits(false, window_bits),
            window_bits,
            no_context_takeover,
            max_size,
        }
    }

    /// Inflates one complete message.
    ///
    /// Runs to completion or fails: either the whole message is returned, or
    /// [`WebSocketError::DecompressionFailure`] / [`WebSocketError::MessageTooBig`].
    /// After a failure the context is unusable and the connection must close.
    pub fn decompress(&mut self, payload: &[u8]) -> Result<Bytes> {
        let mut output = Vec::with_capacity((payload.len() * 2).min(self.max_size) + CHUNK);
        let mut finished = false;

        for mut input in [payload, &TRAILER[..]] {
            while !finished {
                reserve(&mut output);
                let before_in = self.inflate.total_in();
                let before_out = self.inflate.total_out();
                let status = self
                    .inflate
                    .decompress_vec(input, &mut output, FlushDecompress::Sync)
                    .map_err(|err| WebSocketError::DecompressionFailure(err.to_string()))?;
                let consumed = (self.inflate.total_in() - before_in) as usize;
                let produced = self.inflate.total_out() - before_out;
                input = &input[consumed..];

                if output.len() > self.max_size {
                    return Err(WebSocketError::MessageTooBig {
                        size: output.len(),
                        limit: self.max_size,
                    });
                }

                match status {
                    // The peer closed the DEFLATE stream with a final block; the next
                    // message starts a new stream.
                    Status::StreamEnd => finished = true,
                    _ if input.is_empty() && output.len() < output.capacity() => break,
                    _ if consumed == 0 && produced == 0 => {
                        return Err(WebSocketError::DecompressionFailure(
                            "inflate made no progress".into(),
                        ));
                    }
                    _ => {}
                }
            }
        }

        if finished || self.no_context_takeover {
            self.reset();
        }
        Ok(output.into())
    }

    fn reset(&mut self) {
        self.inflate = Decompress::new_with_window_bits(false, self.window_bits);
    }
}

/// The pair of contexts a connection owns: one per direction.
///
/// Either side is `None` when permessage-deflate was not negotiated.
pub struct CompressionContext {
    pub outbound: Option<Compressor>,
    pub inbound: Option<Decompressor>,
}

impl CompressionContext {
    /// A context that neither compresses nor inflates.
    pub fn disabled() -> Self {
        Self {
            outbound: None,
            inbound: None,
        }
    }

    /// Builds both directions from negotiated parameters.
    ///
    /// A client compresses with the `client_*` parameters and inflates with the
    /// `server_*` ones; a server the other way round.
    pub fn new(
        params: &ExtensionParams,
        role: Role,
        level: Compression,
        max_message_size: usize,
    ) -> Self {
        let (out_bits, out_reset, in_bits, in_reset) = match role {
            Role::Client => (
                params.client_max_window_bits,
                params.client_no_context_takeover,
                params.server_max_window_bits,
                params.server_no_context_takeover,
            ),
            Role::Server => (
                params.server_max_window_bits,
                params.server_no_context_takeover,
                params.client_max_window_bits,
                params.client_no_context_takeover,
            ),
        };

        Self {
            outbound: Some(Compressor::new(level, out_bits, out_reset)),
            inbound: Some(Decompressor::new(in_bits, in_reset, max_message_size)),
        }
    }

    /// Compresses an outgoing message, if the outbound direction is enabled.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Option<Bytes>> {
        self.outbound
            .as_mut()
            .map(|deflate| deflate.compress(payload))
            .transpose()
    }

    /// Inflates an incoming message.
    ///
    /// Fails with [`WebSocketError::DecompressionFailure`] if the inbound direction
    /// was never negotiated.
    pub fn decompress(&mut self, payload: &[u8]) -> Result<Bytes> {
        match self.inbound.as_mut() {
            Some(inflate) => inflate.decompress(payload),
            None => Err(WebSocketError::DecompressionFailure(
                "no inbound compression context".into(),
            )),
        }
    }

    pub fn into_parts(self) -> (Option<Compressor>, Option<Decompressor>) {
        (self.outbound, self.inbound)
    }
}

fn deflate_error(err: impl std::fmt::Display) -> WebSocketError {
    WebSocketError::Transport(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("Compression error: {err}"),
    ))
}

/// Ensures at least [`CHUNK`] bytes of spare capacity in `output`.
fn reserve(output: &mut Vec<u8>) {
    if output.capacity() - output.len() < CHUNK {
        output.reserve(CHUNK);
    }
}
