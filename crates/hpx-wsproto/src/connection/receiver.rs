use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf},
    time::Instant,
};
use tokio_util::codec::FramedRead;

use super::{ConnectionId, Event, Sender, Shared, State};
use crate::{
    Result, WebSocketError,
    assembler::{Message, MessageAssembler},
    close::CloseFrame,
    codec::Decoder,
    compression::Decompressor,
    frame::{Frame, OpCode},
};

/// Receiving half of a connection.
///
/// Answers pings and close frames through the connection's [`Sender`], so the
/// close handshake only completes while something is reading.
pub struct Receiver<S> {
    shared: Arc<Shared>,
    stream: FramedRead<ReadHalf<S>, Decoder>,
    assembler: MessageAssembler,
    inflate: Option<Decompressor>,
    sender: Sender<S>,
    done: bool,
}

impl<S> Receiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        shared: Arc<Shared>,
        stream: FramedRead<ReadHalf<S>, Decoder>,
        inflate: Option<Decompressor>,
        sender: Sender<S>,
    ) -> Self {
        let assembler = MessageAssembler::new(shared.config.max_message_size());
        Self {
            shared,
            stream,
            assembler,
            inflate,
            sender,
            done: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Waits for the next event from the peer.
    ///
    /// Fragments are reassembled and decompressed before a message is returned.
    /// Control frames may arrive between the fragments of a message and are
    /// reported as they come.
    ///
    /// A protocol violation, invalid UTF-8, an oversized message or a corrupt
    /// compressed payload fails the connection: a close frame with the matching
    /// status code is sent, the transport is torn down, and the error is returned.
    /// After [`Event::Close`] or an error, every further call returns
    /// [`WebSocketError::ConnectionClosed`].
    pub async fn next_event(&mut self) -> Result<Event> {
        loop {
            if self.done || self.shared.state() == State::Closed {
                self.done = true;
                return Err(WebSocketError::ConnectionClosed);
            }

            let frame = match self.read_frame().await {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail(err).await),
            };

            match frame.opcode() {
                OpCode::Ping => {
                    self.answer_ping(&frame).await?;
                    return Ok(Event::Ping(frame.into_payload()));
                }
                OpCode::Pong => return Ok(Event::Pong(frame.into_payload())),
                OpCode::Close => return self.on_close(&frame).await,
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    match self.assembler.push(frame, self.inflate.as_mut()) {
                        Ok(Some(message)) => return Ok(Event::Message(message)),
                        Ok(None) => continue,
                        Err(err) => return Err(self.fail(err).await),
                    }
                }
            }
        }
    }

    /// Waits for the next data message, skipping control frames. Returns `None`
    /// once the connection has closed.
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        loop {
            match self.next_event().await {
                Ok(Event::Message(message)) => return Ok(Some(message)),
                Ok(Event::Close(_)) | Err(WebSocketError::ConnectionClosed) => return Ok(None),
                Ok(Event::Ping(_) | Event::Pong(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Turns the receiver into a stream of messages.
    ///
    /// The stream ends when the connection closes. A fatal error is yielded once,
    /// then the stream ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> {
        futures::stream::unfold(Some(self), |receiver| async move {
            let Some(mut receiver) = receiver else {
                return None;
            };
            match receiver.receive().await {
                Ok(Some(message)) => Some((Ok(message), Some(receiver))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Reads until the peer's close frame arrives or the connection otherwise
    /// reaches CLOSED, discarding data messages.
    pub(crate) async fn drain_until_closed(&mut self) -> Result<()> {
        loop {
            match self.next_event().await {
                Ok(Event::Close(_)) | Err(WebSocketError::ConnectionClosed) => return Ok(()),
                Ok(Event::Message(message)) => {
                    tracing::trace!(
                        id = %self.shared.id,
                        len = message.payload().len(),
                        "discarding message received while closing"
                    );
                }
                Ok(Event::Ping(_) | Event::Pong(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let deadline = self.shared.close_deadline();
        let next = tokio::select! {
            biased;
            next = self.stream.next() => next,
            _ = self.shared.closed() => {
                self.done = true;
                return Err(WebSocketError::ConnectionClosed);
            }
            _ = until(deadline) => {
                tracing::warn!(
                    id = %self.shared.id,
                    timeout = ?self.shared.close_timeout(),
                    "peer did not answer close frame in time"
                );
                self.done = true;
                self.sender.teardown().await;
                return Err(WebSocketError::ConnectionClosed);
            }
        };

        match next {
            Some(frame) => frame,
            None => {
                self.done = true;
                let closing = self.shared.state() >= State::Closing;
                self.sender.teardown().await;
                if closing {
                    Err(WebSocketError::ConnectionClosed)
                } else {
                    tracing::debug!(id = %self.shared.id, "transport closed without close frame");
                    Err(WebSocketError::Transport(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )))
                }
            }
        }
    }

    async fn answer_ping(&mut self, ping: &Frame) -> Result<()> {
        if !self.shared.config.auto_respond_to_ping() {
            return Ok(());
        }
        match self
            .sender
            .send_control(Frame::pong(ping.payload().clone()))
            .await
        {
            Ok(()) | Err(WebSocketError::ConnectionClosed) => Ok(()),
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }

    async fn on_close(&mut self, frame: &Frame) -> Result<Event> {
        let close = match CloseFrame::parse(frame.payload()) {
            Ok(close) => close,
            Err(err) => return Err(self.fail(err).await),
        };
        tracing::debug!(
            id = %self.shared.id,
            code = ?close.as_ref().map(|close| close.code),
            "close frame received"
        );
        self.shared.set_peer_close(close.clone());
        self.shared.transition(State::Closing);

        let reply = match &close {
            Some(close) => Frame::close(close.code, ""),
            None => Frame::close_empty(),
        };
        let timeout = self.shared.close_timeout();
        match tokio::time::timeout(timeout, self.sender.send_close(reply)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::debug!(id = %self.shared.id, error = %err, "failed to answer close frame");
            }
            Err(_) => {
                tracing::warn!(id = %self.shared.id, ?timeout, "timed out answering close frame");
            }
        }
        self.sender.teardown().await;
        self.done = true;
        Ok(Event::Close(close))
    }

    async fn fail(&mut self, err: WebSocketError) -> WebSocketError {
        self.done = true;
        if !matches!(err, WebSocketError::ConnectionClosed) {
            self.sender.abort(&err).await;
        }
        err
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
