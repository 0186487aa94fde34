#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use hpx_wsproto::{
    CloseCode, CloseFrame, Config, Connection, Decoded, Decoder, DeflateConfig, Encoder, Frame,
    Handshake, Role,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const MAX: usize = 1 << 20;

/// A peer that speaks raw frames, for driving a [`Connection`] with exactly the
/// bytes a test needs.
pub struct RawPeer {
    stream: DuplexStream,
    decoder: Decoder,
    encoder: Encoder,
    buf: BytesMut,
}

impl RawPeer {
    pub fn new(stream: DuplexStream, role: Role, compression: bool) -> Self {
        Self {
            stream,
            decoder: Decoder::new(role, MAX).with_compression(compression),
            encoder: Encoder::new(role, MAX),
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = self.encoder.encode_frame(frame).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next frame, or `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Decoded::Frame { frame, consumed } = self.decoder.decode_slice(&self.buf).unwrap()
            {
                self.buf.advance(consumed);
                return Some(frame);
            }
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    /// Reads until a close frame and returns its parsed payload.
    pub async fn recv_close(&mut self) -> Option<CloseFrame> {
        while let Some(frame) = self.recv().await {
            if frame.opcode() == hpx_wsproto::OpCode::Close {
                return CloseFrame::parse(frame.payload()).unwrap();
            }
        }
        panic!("stream ended without a close frame");
    }

    pub async fn close_code(&mut self) -> CloseCode {
        self.recv_close().await.map(|close| close.code).unwrap()
    }
}

pub fn deflate(threshold: usize) -> DeflateConfig {
    DeflateConfig {
        compression_threshold: threshold,
        ..Default::default()
    }
}

pub fn compressed_config(threshold: usize) -> Config {
    Config::builder()
        .permessage_deflate(deflate(threshold))
        .build()
        .unwrap()
}

/// Runs the extension handshake between two engines and opens both ends.
pub fn connected(
    server: Config,
    client: Config,
) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let mut client = Handshake::client(client);
    let mut server = Handshake::server(server);

    let offer = client.offer();
    let response = server.accept_offer(offer.as_deref()).unwrap();
    client.accept_response(response.as_deref()).unwrap();

    (server.open(a), client.open(b))
}

/// An engine server facing a raw client.
pub fn server_with_raw_client(
    mut handshake: Handshake,
    offer: Option<&str>,
) -> (Connection<DuplexStream>, RawPeer) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    handshake.accept_offer(offer).unwrap();
    let compression = handshake.negotiated().is_some();
    (
        handshake.open(a),
        RawPeer::new(b, Role::Client, compression),
    )
}
