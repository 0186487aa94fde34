use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::SinkExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::{Mutex, MutexGuard, Semaphore},
};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};

use super::{ConnectionId, SendOptions, Shared, State};
use crate::{
    Result, WebSocketError,
    assembler::Message,
    close::{CloseCode, CloseFrame},
    codec::{Encoder, Role},
    compression::Compressor,
    config::SendPolicy,
    extensions::ExtensionParams,
    frame::{Frame, OpCode},
};

/// The outbound side of the transport and the outbound DEFLATE context.
pub(crate) struct Writer<S> {
    sink: FramedWrite<WriteHalf<S>, Encoder>,
    deflate: Option<Compressor>,
    torn_down: bool,
    /// Cancelled on teardown. Interrupts a write stuck on a transport the peer
    /// no longer reads, so the lock is released.
    shutdown: CancellationToken,
}

impl<S> Writer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(sink: FramedWrite<WriteHalf<S>, Encoder>, deflate: Option<Compressor>) -> Self {
        Self {
            sink,
            deflate,
            torn_down: false,
            shutdown: CancellationToken::new(),
        }
    }

    async fn write(&mut self, frames: impl IntoIterator<Item = Frame>) -> Result<()> {
        let sink = &mut self.sink;
        let io = async move {
            for frame in frames {
                sink.feed(frame).await?;
            }
            sink.flush().await
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(WebSocketError::ConnectionClosed),
            res = io => res,
        }
    }
}

/// Sending half of a connection.
///
/// Cheap to clone; all clones feed the same serialized outbound path.
pub struct Sender<S> {
    shared: Arc<Shared>,
    writer: Arc<Mutex<Writer<S>>>,
    queue: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl<S> Clone for Sender<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            writer: Arc::clone(&self.writer),
            queue: self.queue.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S> Sender<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(shared: Arc<Shared>, writer: Writer<S>) -> Self {
        let queue = match shared.config.send_policy() {
            SendPolicy::Bounded(bound) => Some(Arc::new(Semaphore::new(bound))),
            SendPolicy::Unbounded | SendPolicy::FailFast => None,
        };
        let shutdown = writer.shutdown.clone();
        Self {
            shared,
            writer: Arc::new(Mutex::new(writer)),
            queue,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn negotiated(&self) -> Option<ExtensionParams> {
        self.shared.params
    }

    pub fn peer_close(&self) -> Option<CloseFrame> {
        self.shared.peer_close()
    }

    /// Sends one message.
    ///
    /// The payload is compressed when `options.compress` is set, the extension was
    /// negotiated for this direction and the payload is at least the configured
    /// threshold. Messages larger than the fragment size go out as several frames.
    /// Returns once the transport has accepted the bytes.
    ///
    /// Fails with [`WebSocketError::ConnectionClosed`] unless the connection is
    /// OPEN, with [`WebSocketError::SendQueueFull`] when the send policy refuses to
    /// wait, and with [`WebSocketError::InvalidUTF8`] for a text payload that is not
    /// UTF-8 (the connection stays open).
    pub async fn send(&self, data: impl Into<Bytes>, options: SendOptions) -> Result<()> {
        self.ensure_open()?;
        let payload = data.into();
        if !options.binary && std::str::from_utf8(&payload).is_err() {
            return Err(WebSocketError::InvalidUTF8);
        }

        let _permit = match &self.queue {
            Some(queue) => Some(
                Arc::clone(queue)
                    .try_acquire_owned()
                    .map_err(|_| WebSocketError::SendQueueFull)?,
            ),
            None => None,
        };
        let mut writer = self.lock_for_send().await?;
        self.ensure_open()?;

        let opcode = if options.binary {
            OpCode::Binary
        } else {
            OpCode::Text
        };
        let threshold = self
            .shared
            .config
            .permessage_deflate()
            .map_or(usize::MAX, |deflate| deflate.compression_threshold);

        let deflated = match writer.deflate.as_mut() {
            Some(deflate) if options.compress && payload.len() >= threshold => {
                Some(deflate.compress(&payload))
            }
            _ => None,
        };
        let frame = match deflated {
            Some(Ok(compressed)) => Frame::new(true, opcode, None, compressed).with_rsv1(true),
            Some(Err(err)) => return Err(self.fail_locked(&mut writer, err).await),
            None => Frame::new(true, opcode, None, payload),
        };

        let config = &self.shared.config;
        let fragment = config
            .fragment_size()
            .unwrap_or(config.max_frame_size())
            .min(config.max_frame_size());

        tracing::trace!(
            id = %self.shared.id,
            ?opcode,
            compressed = frame.is_compressed(),
            len = frame.payload().len(),
            "sending message"
        );
        match writer.write(frame.into_fragments(fragment)).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_locked(&mut writer, err).await),
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Bytes::from(text.into()), SendOptions::text()).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(data, SendOptions::binary()).await
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        let options = SendOptions::from(message.kind());
        self.send(message.into_payload(), options).await
    }

    /// Sends a ping with up to 125 bytes of payload.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        self.send_control(Frame::ping(payload)).await
    }

    /// Starts the close handshake and waits for the connection to reach CLOSED.
    ///
    /// The peer's close frame is picked up by the [`Receiver`](super::Receiver),
    /// which must be running for the handshake to finish before the close timeout.
    /// On timeout the transport is torn down. Does nothing unless OPEN.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if !self.initiate_close(code, reason).await? {
            return Ok(());
        }
        let timeout = self.shared.close_timeout();
        if tokio::time::timeout(timeout, self.shared.closed()).await.is_err() {
            tracing::warn!(id = %self.shared.id, ?timeout, "close handshake timed out");
            self.teardown().await;
        }
        Ok(())
    }

    /// Sends our close frame if the connection is OPEN. Returns `false` when the
    /// close handshake is already underway or over.
    pub(crate) async fn initiate_close(&self, code: CloseCode, reason: &str) -> Result<bool> {
        if self.shared.state() != State::Open {
            return Ok(false);
        }
        self.send_close(Frame::close(code, reason)).await
    }

    /// Sends a close frame unless one was sent already, moving to CLOSING.
    pub(crate) async fn send_close(&self, frame: Frame) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        if writer.torn_down || !self.shared.claim_close() {
            return Ok(false);
        }
        self.shared.transition(State::Closing);
        match writer.write([frame]).await {
            Ok(()) => Ok(true),
            Err(err) => Err(self.fail_locked(&mut writer, err).await),
        }
    }

    /// Sends a control frame outside the send queue accounting.
    ///
    /// Pongs still go out after our close frame; pings do not.
    pub(crate) async fn send_control(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.torn_down || (frame.opcode() != OpCode::Pong && self.shared.close_sent()) {
            return Err(WebSocketError::ConnectionClosed);
        }
        match writer.write([frame]).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_locked(&mut writer, err).await),
        }
    }

    /// Tears the connection down after a fatal error.
    ///
    /// A close frame carrying the error's close code is attempted first, bounded by
    /// the close timeout. Transport errors skip it.
    pub(crate) async fn abort(&self, err: &WebSocketError) {
        tracing::debug!(id = %self.shared.id, role = %self.shared.role, error = %err, "connection failed");
        let timeout = self.shared.close_timeout();
        if let Some(code) = err.close_code() {
            let frame = Frame::close(code, err.to_string());
            let _ = tokio::time::timeout(timeout, self.send_close(frame)).await;
        }
        if tokio::time::timeout(timeout, self.teardown()).await.is_err() {
            self.shared.transition(State::Closed);
        }
    }

    /// Shuts the transport's write side down and marks the connection CLOSED.
    /// Safe to call any number of times.
    ///
    /// A write in progress is cancelled first, so this never waits on a peer that
    /// stopped reading.
    pub(crate) async fn teardown(&self) {
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        Self::teardown_locked(&mut writer, self.shared.close_timeout()).await;
        self.shared.transition(State::Closed);
    }

    /// Completed writes are always flushed, so only the bytes of a cancelled
    /// write can still be buffered. They are dropped.
    async fn teardown_locked(writer: &mut Writer<S>, timeout: Duration) {
        if !std::mem::replace(&mut writer.torn_down, true) {
            writer.shutdown.cancel();
            let _ = tokio::time::timeout(timeout, writer.sink.get_mut().shutdown()).await;
            writer.deflate = None;
        }
    }

    /// Handles an error raised while holding the writer.
    ///
    /// Transport failures (the compressor reports through the same variant) tear
    /// the connection down. Anything else leaves it usable.
    async fn fail_locked(&self, writer: &mut MutexGuard<'_, Writer<S>>, err: WebSocketError) -> WebSocketError {
        if matches!(err, WebSocketError::Transport(_)) {
            tracing::debug!(id = %self.shared.id, error = %err, "transport failed while sending");
            Self::teardown_locked(writer, self.shared.close_timeout()).await;
            self.shared.transition(State::Closed);
        }
        err
    }

    async fn lock_for_send(&self) -> Result<MutexGuard<'_, Writer<S>>> {
        match self.shared.config.send_policy() {
            SendPolicy::FailFast => self
                .writer
                .try_lock()
                .map_err(|_| WebSocketError::SendQueueFull),
            SendPolicy::Unbounded | SendPolicy::Bounded(_) => Ok(self.writer.lock().await),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.shared.state() {
            State::Open => Ok(()),
            _ => Err(WebSocketError::ConnectionClosed),
        }
    }
}
