//! Stream multiplexer.
//!
//! Runs many logical streams over one TCP/TLS connection. The client opens
//! odd-numbered streams (the control stream); the server opens streams for
//! inbound public requests, which surface through [`MuxSession::accept`].
//!
//! Uses `DashMap` for concurrent stream routing, an `AtomicU32` for
//! lock-free stream ID allocation, and `kanal` channels between the session
//! tasks and the virtual streams.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use kanal::{bounded_async, AsyncReceiver, AsyncSender, ReceiveError, SendError};
use portico_common::{Result, TunnelError};
use portico_protocol::{CloseReason, Frame, MuxCodec};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Frames buffered per stream before the session read loop backpressures.
const STREAM_BUFFER: usize = 10;
/// Outbound frames buffered between streams and the write task.
const FRAME_BUFFER: usize = 64;
/// Inbound streams waiting in the accept queue.
const ACCEPT_BUFFER: usize = 10;

#[derive(Clone)]
struct Multiplexer {
    streams: Arc<DashMap<u32, AsyncSender<Frame>>>,
    next_stream_id: Arc<AtomicU32>,
    frame_tx: AsyncSender<Frame>,
    new_stream_tx: AsyncSender<VirtualStream>,
}

impl Multiplexer {
    /// Allocate a new client-side stream ID (odd, lock-free).
    #[inline]
    fn allocate_stream_id(&self) -> u32 {
        self.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Route one frame from the wire to its stream, or surface a new
    /// server-initiated stream on the accept queue.
    async fn process_frame(&self, frame: Frame) {
        match &frame {
            Frame::OpenStream { stream_id } => {
                let stream_id = *stream_id;
                let (tx, rx) = bounded_async(STREAM_BUFFER);

                match self.streams.entry(stream_id) {
                    Entry::Occupied(_) => {
                        warn!("stream {} already exists", stream_id);
                        return;
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(tx);
                    }
                }

                let stream = VirtualStream::new(stream_id, rx, self.frame_tx.clone());
                if self.new_stream_tx.send(stream).await.is_err() {
                    debug!("accept queue closed, dropping stream {}", stream_id);
                    self.streams.remove(&stream_id);
                }
            }
            Frame::Data { stream_id, .. } | Frame::CloseStream { stream_id, .. } => {
                let stream_id = *stream_id;
                let tx = self.streams.get(&stream_id).map(|r| r.clone());
                let is_close = matches!(frame, Frame::CloseStream { .. });

                if let Some(tx) = tx {
                    if tx.send(frame).await.is_err() || is_close {
                        self.streams.remove(&stream_id);
                    }
                }
            }
            Frame::GoAway => {}
        }
    }

    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<VirtualStream> {
        let stream_id = self.allocate_stream_id();

        let (tx, rx) = bounded_async(STREAM_BUFFER);
        self.streams.insert(stream_id, tx);

        self.frame_tx
            .send(Frame::OpenStream { stream_id })
            .await
            .map_err(|e| {
                TunnelError::Connection(format!("failed to open stream {stream_id}: {e}"))
            })?;

        Ok(VirtualStream::new(stream_id, rx, self.frame_tx.clone()))
    }

    /// Tear down all stream routing. Readers see EOF, the accept queue
    /// closes, writers get broken-pipe errors.
    fn shutdown(&self) {
        for entry in self.streams.iter() {
            entry.value().close();
        }
        self.streams.clear();
        self.new_stream_tx.close();
        self.frame_tx.close();
    }
}

/// A multiplexed session owned by the tunnel transport task.
pub struct MuxSession {
    mux: Multiplexer,
    accept_rx: AsyncReceiver<VirtualStream>,
    last_error: Arc<Mutex<Option<String>>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl MuxSession {
    /// Layer a client session over a connected socket. Spawns the read and
    /// write tasks that own the socket.
    pub fn client<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (frame_tx, frame_rx) = bounded_async::<Frame>(FRAME_BUFFER);
        let (new_stream_tx, accept_rx) = bounded_async(ACCEPT_BUFFER);

        let mux = Multiplexer {
            streams: Arc::new(DashMap::new()),
            next_stream_id: Arc::new(AtomicU32::new(1)),
            frame_tx,
            new_stream_tx,
        };

        let framed = Framed::new(io, MuxCodec::new());
        let (mut sink, mut frames) = framed.split();

        let write_task = tokio::spawn(async move {
            while let Ok(frame) = frame_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!("session write ended: {e}");
                    frame_rx.close();
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let last_error = Arc::new(Mutex::new(None));
        let read_mux = mux.clone();
        let read_error = last_error.clone();
        let read_task = tokio::spawn(async move {
            let reason = loop {
                match frames.next().await {
                    Some(Ok(Frame::GoAway)) => break "session closed by peer".to_string(),
                    Some(Ok(frame)) => read_mux.process_frame(frame).await,
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection closed".to_string(),
                }
            };
            *read_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
            read_mux.shutdown();
        });

        Self {
            mux,
            accept_rx,
            last_error,
            read_task,
            write_task,
        }
    }

    /// Open a client-initiated stream (the handshake control stream).
    pub async fn open_stream(&self) -> Result<VirtualStream> {
        self.mux.open_stream().await
    }

    /// Wait for the next server-initiated stream. Errors once the session
    /// has ended, carrying the terminating cause.
    pub async fn accept(&mut self) -> Result<VirtualStream> {
        match self.accept_rx.recv().await {
            Ok(stream) => Ok(stream),
            Err(_) => {
                let cause = self
                    .last_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_else(|| "session closed".to_string());
                Err(TunnelError::Connection(format!("session ended: {cause}")))
            }
        }
    }

    /// Orderly close: announce `GoAway`, then tear down stream routing.
    /// Unblocks a pending [`accept`](Self::accept).
    pub async fn close(&self) {
        let _ = self.mux.frame_tx.send(Frame::GoAway).await;
        self.mux.shutdown();
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.mux.shutdown();
        self.read_task.abort();
        self.write_task.abort();
    }
}

/// Boxed future type for receiving frames
type RecvFuture =
    Pin<Box<dyn std::future::Future<Output = std::result::Result<Frame, ReceiveError>> + Send>>;

/// Boxed future type for sending frames
type SendFuture =
    Pin<Box<dyn std::future::Future<Output = std::result::Result<(), SendError>> + Send>>;

/// One logical stream of a [`MuxSession`], usable as a socket.
///
/// The polling implementation bridges kanal's async API with tokio's
/// poll-based traits through boxed futures.
pub struct VirtualStream {
    stream_id: u32,
    rx: AsyncReceiver<Frame>,
    tx: AsyncSender<Frame>,
    read_buffer: Vec<u8>,
    read_closed: bool,
    close_sent: bool,
    pending_recv: Option<RecvFuture>,
    pending_send: Option<SendFuture>,
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("stream_id", &self.stream_id)
            .field("read_buffer_len", &self.read_buffer.len())
            .finish_non_exhaustive()
    }
}

impl VirtualStream {
    fn new(stream_id: u32, rx: AsyncReceiver<Frame>, tx: AsyncSender<Frame>) -> Self {
        Self {
            stream_id,
            rx,
            tx,
            read_buffer: Vec::new(),
            read_closed: false,
            close_sent: false,
            pending_recv: None,
            pending_send: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            // Drain buffered bytes first
            if !self.read_buffer.is_empty() {
                let len = std::cmp::min(buf.remaining(), self.read_buffer.len());
                buf.put_slice(&self.read_buffer[..len]);
                self.read_buffer.drain(..len);
                return Poll::Ready(Ok(()));
            }

            if self.read_closed {
                return Poll::Ready(Ok(())); // EOF
            }

            if self.pending_recv.is_none() {
                let rx = self.rx.clone();
                self.pending_recv = Some(Box::pin(async move { rx.recv().await }));
            }

            // The future was just set above if absent
            #[allow(clippy::unwrap_used)]
            let fut = self.pending_recv.as_mut().unwrap();
            match fut.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    self.pending_recv = None;
                    match result {
                        Ok(Frame::Data {
                            data,
                            end_of_stream,
                            ..
                        }) => {
                            if end_of_stream {
                                self.read_closed = true;
                            }
                            if data.is_empty() {
                                continue;
                            }
                            let len = std::cmp::min(buf.remaining(), data.len());
                            buf.put_slice(&data[..len]);
                            if len < data.len() {
                                self.read_buffer.extend_from_slice(&data[len..]);
                            }
                            return Poll::Ready(Ok(()));
                        }
                        Ok(Frame::CloseStream { .. })
                        | Err(ReceiveError::Closed | ReceiveError::SendClosed) => {
                            self.read_closed = true;
                            return Poll::Ready(Ok(())); // EOF
                        }
                        Ok(_) => continue, // not addressed to stream payloads
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Finish an in-flight send first; callers retry with the same buf.
        if let Some(fut) = self.pending_send.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    self.pending_send = None;
                    return match result {
                        Ok(()) => Poll::Ready(Ok(buf.len())),
                        Err(e) => Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            e.to_string(),
                        ))),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        let frame = Frame::Data {
            stream_id: self.stream_id,
            data: bytes::Bytes::copy_from_slice(buf),
            end_of_stream: false,
        };

        let tx = self.tx.clone();
        self.pending_send = Some(Box::pin(async move { tx.send(frame).await }));

        // The future was just set above
        #[allow(clippy::unwrap_used)]
        let fut = self.pending_send.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.pending_send = None;
                match result {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        e.to_string(),
                    ))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the write task as they are produced
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(fut) = self.pending_send.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(_) => self.pending_send = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        // The close frame goes out exactly once
        if self.close_sent {
            return Poll::Ready(Ok(()));
        }

        let frame = Frame::CloseStream {
            stream_id: self.stream_id,
            reason: CloseReason::Normal,
        };

        let tx = self.tx.clone();
        self.pending_send = Some(Box::pin(async move { tx.send(frame).await }));

        // The future was just set above
        #[allow(clippy::unwrap_used)]
        let fut = self.pending_send.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.pending_send = None;
                self.close_sent = true;
                match result {
                    Ok(()) => Poll::Ready(Ok(())),
                    // Session already torn down; the stream is closed either way
                    Err(_) => Poll::Ready(Ok(())),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Frame-level peer driving the far end of an in-memory connection.
    fn peer(
        io: tokio::io::DuplexStream,
    ) -> (
        futures::stream::SplitSink<Framed<tokio::io::DuplexStream, MuxCodec>, Frame>,
        futures::stream::SplitStream<Framed<tokio::io::DuplexStream, MuxCodec>>,
    ) {
        Framed::new(io, MuxCodec::new()).split()
    }

    #[tokio::test]
    async fn test_open_stream_emits_open_frame() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = MuxSession::client(client_io);
        let (_sink, mut frames) = peer(server_io);

        let stream = session.open_stream().await.unwrap();
        assert_eq!(stream.id(), 1);

        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::OpenStream { stream_id: 1 });

        // Client IDs are odd and strictly increasing
        let stream2 = session.open_stream().await.unwrap();
        assert_eq!(stream2.id(), 3);
    }

    #[tokio::test]
    async fn test_accept_and_read_inbound_stream() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut session = MuxSession::client(client_io);
        let (mut sink, _frames) = peer(server_io);

        sink.send(Frame::OpenStream { stream_id: 2 }).await.unwrap();
        sink.send(Frame::Data {
            stream_id: 2,
            data: bytes::Bytes::from_static(b"hello"),
            end_of_stream: false,
        })
        .await
        .unwrap();
        sink.send(Frame::CloseStream {
            stream_id: 2,
            reason: CloseReason::Normal,
        })
        .await
        .unwrap();

        let mut stream = session.accept().await.unwrap();
        assert_eq!(stream.id(), 2);

        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_write_produces_data_frames() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = MuxSession::client(client_io);
        let (_sink, mut frames) = peer(server_io);

        let mut stream = session.open_stream().await.unwrap();
        assert!(matches!(
            frames.next().await.unwrap().unwrap(),
            Frame::OpenStream { .. }
        ));

        stream.write_all(b"ping").await.unwrap();
        let frame = frames.next().await.unwrap().unwrap();
        match frame {
            Frame::Data {
                stream_id, data, ..
            } => {
                assert_eq!(stream_id, 1);
                assert_eq!(&data[..], b"ping");
            }
            other => panic!("expected data frame, got {other:?}"),
        }

        stream.shutdown().await.unwrap();
        let frame = frames.next().await.unwrap().unwrap();
        assert!(matches!(frame, Frame::CloseStream { stream_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_accept_fails_when_peer_disconnects() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut session = MuxSession::client(client_io);

        drop(server_io);

        let err = session.accept().await.unwrap_err();
        assert!(matches!(err, TunnelError::Connection(_)));
    }

    #[tokio::test]
    async fn test_accept_fails_on_goaway() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut session = MuxSession::client(client_io);
        let (mut sink, _frames) = peer(server_io);

        sink.send(Frame::GoAway).await.unwrap();

        let err = session.accept().await.unwrap_err();
        assert!(err.to_string().contains("session ended"));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let mut session = MuxSession::client(client_io);

        session.close().await;
        assert!(session.accept().await.is_err());
    }
}
