//! The connection state machine.
//!
//! A [`Connection`] owns one endpoint of an open WebSocket: the frame codec on both
//! directions of the transport, the [`MessageAssembler`] for inbound fragments and
//! the compression contexts negotiated during the handshake.
//!
//! ```text
//!   CONNECTING ──handshake──▶ OPEN ──close sent/received──▶ CLOSING ──teardown──▶ CLOSED
//!                              │                                │
//!                              └──── fatal error / transport ───┴──────────────▶ CLOSED
//! ```
//!
//! # Concurrency
//!
//! [`Connection::split`] hands out a cloneable [`Sender`] and a single [`Receiver`]
//! that can run on different tasks. All outbound frames, including pongs and close
//! frames produced by the receiver, go through one async mutex, because the
//! outbound DEFLATE context is strictly sequential. The receiver processes frames one
//! at a time and is the only owner of the inbound context.

mod receiver;
mod sender;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::Stream;
pub use receiver::Receiver;
pub use sender::Sender;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
    time::Instant,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    Result,
    assembler::{Message, MessageKind},
    close::{CloseCode, CloseFrame},
    codec::{Decoder, Encoder, Role},
    compression::CompressionContext,
    config::Config,
    extensions::ExtensionParams,
};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Something the peer did, as seen by [`Receiver::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete data message.
    Message(Message),
    /// A ping; already answered when auto-respond is enabled.
    Ping(Bytes),
    Pong(Bytes),
    /// The peer's close frame, `None` if it carried no status code. This is the
    /// last event of a connection.
    Close(Option<CloseFrame>),
}

/// Per-send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Send as a binary message instead of text.
    pub binary: bool,
    /// Allow compression. It is applied only if negotiated for the outbound
    /// direction and the payload reaches the configured threshold.
    pub compress: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            binary: false,
            compress: true,
        }
    }
}

impl SendOptions {
    pub fn text() -> Self {
        Self::default()
    }

    pub fn binary() -> Self {
        Self {
            binary: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }
}

impl From<MessageKind> for SendOptions {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => Self::text(),
            MessageKind::Binary => Self::binary(),
        }
    }
}

/// State visible to both halves of a connection.
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) role: Role,
    pub(crate) config: Config,
    pub(crate) params: Option<ExtensionParams>,
    state: watch::Sender<State>,
    close_sent: AtomicBool,
    close_deadline: parking_lot::Mutex<Option<Instant>>,
    peer_close: parking_lot::Mutex<Option<CloseFrame>>,
}

impl Shared {
    pub(crate) fn new(role: Role, config: Config, params: Option<ExtensionParams>) -> Self {
        Self {
            id: ConnectionId::next(),
            role,
            config,
            params,
            state: watch::Sender::new(State::Connecting),
            close_sent: AtomicBool::new(false),
            close_deadline: parking_lot::Mutex::new(None),
            peer_close: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Moves the state forward. Returns `false` if the connection is already at or
    /// past `to`.
    pub(crate) fn transition(&self, to: State) -> bool {
        let mut from = to;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(id = %self.id, role = %self.role, %from, %to, "state transition");
        }
        changed
    }

    /// Resolves once the connection reaches CLOSED.
    pub(crate) async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == State::Closed).await;
    }

    /// Marks the close frame as sent. Returns `false` if one already was.
    pub(crate) fn claim_close(&self) -> bool {
        let first = !self.close_sent.swap(true, Ordering::AcqRel);
        if first {
            *self.close_deadline.lock() = Some(Instant::now() + self.config.close_timeout());
        }
        first
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    pub(crate) fn close_deadline(&self) -> Option<Instant> {
        *self.close_deadline.lock()
    }

    pub(crate) fn set_peer_close(&self, frame: Option<CloseFrame>) {
        *self.peer_close.lock() = frame;
    }

    pub(crate) fn peer_close(&self) -> Option<CloseFrame> {
        self.peer_close.lock().clone()
    }

    pub(crate) fn close_timeout(&self) -> Duration {
        self.config.close_timeout()
    }
}

/// Wires a transport into an OPEN connection.
///
/// `buffered` holds bytes read past the end of the HTTP upgrade; they are decoded
/// before anything else from the transport.
pub(crate) fn open<S>(
    stream: S,
    buffered: &[u8],
    role: Role,
    config: Config,
    params: Option<ExtensionParams>,
) -> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let max_frame_size = config.max_frame_size();
    let compression = match (&params, config.permessage_deflate()) {
        (Some(params), Some(deflate)) => {
            CompressionContext::new(params, role, deflate.level, config.max_message_size())
        }
        _ => CompressionContext::disabled(),
    };
    let (deflate, inflate) = compression.into_parts();

    let (read, write) = tokio::io::split(stream);
    let decoder = Decoder::new(role, max_frame_size).with_compression(inflate.is_some());
    let mut frames = FramedRead::new(read, decoder);
    frames.read_buffer_mut().extend_from_slice(buffered);
    let sink = FramedWrite::new(write, Encoder::new(role, max_frame_size));

    let shared = Arc::new(Shared::new(role, config, params));
    shared.transition(State::Open);
    tracing::debug!(
        id = %shared.id,
        %role,
        compression = deflate.is_some(),
        "connection open"
    );

    let sender = Sender::new(Arc::clone(&shared), sender::Writer::new(sink, deflate));
    let receiver = Receiver::new(shared, frames, inflate, sender.clone());
    Connection::new(sender, receiver)
}

/// An open WebSocket connection.
///
/// Created by [`crate::Handshake::open`]. Use it directly from one task, or
/// [`split`](Self::split) it to read and write concurrently.
pub struct Connection<S> {
    sender: Sender<S>,
    receiver: Receiver<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(sender: Sender<S>, receiver: Receiver<S>) -> Self {
        Self { sender, receiver }
    }

    pub fn id(&self) -> ConnectionId {
        self.sender.id()
    }

    pub fn role(&self) -> Role {
        self.sender.role()
    }

    pub fn state(&self) -> State {
        self.sender.state()
    }

    /// Parameters of the negotiated `permessage-deflate` extension, if any.
    pub fn negotiated(&self) -> Option<ExtensionParams> {
        self.sender.negotiated()
    }

    /// The close frame received from the peer, once there is one.
    pub fn peer_close(&self) -> Option<CloseFrame> {
        self.sender.peer_close()
    }

    /// Sends one message. See [`Sender::send`].
    pub async fn send(&self, data: impl Into<Bytes>, options: SendOptions) -> Result<()> {
        self.sender.send(data, options).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.sender.send_text(text).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.sender.send_binary(data).await
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.sender.send_message(message).await
    }

    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.sender.ping(payload).await
    }

    /// Next event from the peer. See [`Receiver::next_event`].
    pub async fn next_event(&mut self) -> Result<Event> {
        self.receiver.next_event().await
    }

    /// Next data message, or `None` once the connection has closed.
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        self.receiver.receive().await
    }

    /// Consumes the connection into a stream of messages. See
    /// [`Receiver::into_stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> {
        self.receiver.into_stream()
    }

    /// Runs the close handshake from OPEN.
    ///
    /// Sends a close frame, then keeps reading until the peer's close frame arrives
    /// or the close timeout elapses; either way the transport is torn down. Messages
    /// arriving in the meantime are discarded. Calling it in any other state does
    /// nothing.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if !self.sender.initiate_close(code, reason).await? {
            return Ok(());
        }
        self.receiver.drain_until_closed().await
    }

    /// A handle for sending from elsewhere, e.g. a [`crate::ConnectionRegistry`].
    pub fn sender(&self) -> Sender<S> {
        self.sender.clone()
    }

    /// Splits the connection into halves for concurrent use.
    pub fn split(self) -> (Sender<S>, Receiver<S>) {
        (self.sender, self.receiver)
    }
}
