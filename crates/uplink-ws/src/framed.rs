//! Framed channel implementation.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::stream::{SplitSink, SplitStream, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, warn};

use crate::{CLOSE_REASON, MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, WRITE_WAIT};

/// The WebSocket message kind a channel is locked to. A message of the other
/// kind on an established channel is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Binary,
    Text,
}

/// Hook invoked with every pong payload, in addition to the built-in read
/// deadline extension.
pub type PongHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Channel construction options.
#[derive(Clone)]
pub struct FramedConfig {
    /// Message kind enforced on reads and used for writes.
    pub kind: MessageKind,
    /// Whether to run the background ping ticker.
    pub ping_enabled: bool,
    /// Optional observer for inbound pongs.
    pub pong_hook: Option<PongHook>,
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self {
            kind: MessageKind::Binary,
            ping_enabled: true,
            pong_hook: None,
        }
    }
}

impl std::fmt::Debug for FramedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConfig")
            .field("kind", &self.kind)
            .field("ping_enabled", &self.ping_enabled)
            .field("pong_hook", &self.pong_hook.is_some())
            .finish()
    }
}

/// Cheap handle for sending a close frame after the socket itself has been
/// handed off to a multiplexer.
#[derive(Clone)]
pub struct FramedControl {
    tx: mpsc::Sender<Message>,
}

impl FramedControl {
    /// Send a normal-closure frame carrying `reason`.
    pub async fn close_with_reason(&self, reason: &str) {
        let _ = self.tx.send(close_message(reason)).await;
    }

    /// Send the default close frame.
    pub async fn close(&self) {
        self.close_with_reason(CLOSE_REASON).await;
    }
}

/// A reliable ordered byte stream over a WebSocket.
///
/// All writes, including pings and close frames, are funnelled through a
/// single writer task that owns the sink half of the socket, so the channel
/// is safe to share between a multiplexer and the liveness ticker.
pub struct FramedSocket<S> {
    reader: SplitStream<WebSocketStream<S>>,
    writer: PollSender<Message>,
    control: mpsc::Sender<Message>,
    residual: Bytes,
    read_deadline: Pin<Box<Sleep>>,
    kind: MessageKind,
    pong_hook: Option<PongHook>,
    // Fired once when a close frame arrives; terminates the ping task.
    peer_closed: CancellationToken,
    ping_task: Option<JoinHandle<()>>,
}

impl<S> FramedSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a connected WebSocket.
    pub fn new(socket: WebSocketStream<S>, config: FramedConfig) -> Self {
        let (sink, reader) = socket.split();
        let (tx, rx) = mpsc::channel::<Message>(16);
        let peer_closed = CancellationToken::new();

        tokio::spawn(write_loop(sink, rx));

        let ping_task = config
            .ping_enabled
            .then(|| tokio::spawn(ping_loop(tx.clone(), peer_closed.clone())));

        Self {
            reader,
            writer: PollSender::new(tx.clone()),
            control: tx,
            residual: Bytes::new(),
            read_deadline: Box::pin(sleep(PONG_WAIT)),
            kind: config.kind,
            pong_hook: config.pong_hook,
            peer_closed,
            ping_task,
        }
    }

    /// Handle for closing the channel once the socket value has been moved
    /// into a session.
    pub fn control(&self) -> FramedControl {
        FramedControl {
            tx: self.control.clone(),
        }
    }

    /// Send a normal-closure frame carrying `reason`.
    pub async fn close_with_reason(&self, reason: &str) {
        let _ = self.control.send(close_message(reason)).await;
    }
}

impl<S> Drop for FramedSocket<S> {
    fn drop(&mut self) {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }
}

fn close_message(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.to_owned().into(),
    }))
}

/// Writer task. Owns the sink half; serialises data frames, pings and the
/// close frame, applying the write deadline to each send.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        match timeout(WRITE_WAIT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("websocket write failed: {e}");
                break;
            }
            Err(_) => {
                warn!("websocket write deadline elapsed");
                break;
            }
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Liveness ticker. Exits when the peer closes or the writer is gone.
async fn ping_loop(tx: mpsc::Sender<Message>, peer_closed: CancellationToken) {
    let mut ticker = interval(PING_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = peer_closed.cancelled() => return,
            _ = ticker.tick() => {
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}

impl<S> AsyncRead for FramedSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.residual.is_empty() {
                let n = this.residual.len().min(buf.remaining());
                buf.put_slice(&this.residual[..n]);
                this.residual.advance(n);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.reader).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => {
                    this.read_deadline
                        .as_mut()
                        .reset(Instant::now() + PONG_WAIT);
                    match (message, this.kind) {
                        (Message::Binary(data), MessageKind::Binary) => {
                            // A zero-length message is skipped so the caller
                            // always observes a nonzero read or an error.
                            if !data.is_empty() {
                                this.residual = Bytes::from(data);
                            }
                        }
                        (Message::Text(data), MessageKind::Text) => {
                            if !data.is_empty() {
                                this.residual = Bytes::from(data.into_bytes());
                            }
                        }
                        (Message::Text(_), MessageKind::Binary) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "unexpected text message on binary channel",
                            )));
                        }
                        (Message::Binary(_), MessageKind::Text) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "unexpected binary message on text channel",
                            )));
                        }
                        (Message::Pong(payload), _) => {
                            if let Some(hook) = &this.pong_hook {
                                hook(&payload);
                            }
                        }
                        // Pings are answered by the WebSocket layer itself.
                        (Message::Ping(_), _) => {}
                        // A close frame ends the byte stream cleanly and
                        // stops the ping task.
                        (Message::Close(_), _) => {
                            this.peer_closed.cancel();
                            return Poll::Ready(Ok(()));
                        }
                        (Message::Frame(_), _) => {}
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {
                    if this.read_deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read deadline elapsed waiting for peer traffic",
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<S> AsyncWrite for FramedSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match this.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                // Chunk to the peer's inbound message limit; AsyncWrite's
                // partial-write contract keeps this transparent to callers.
                let n = buf.len().min(MAX_MESSAGE_SIZE);
                let message = match this.kind {
                    MessageKind::Binary => Message::Binary(buf[..n].to_vec()),
                    MessageKind::Text => match std::str::from_utf8(&buf[..n]) {
                        Ok(text) => Message::Text(text.to_owned()),
                        Err(_) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "text channel requires utf-8 payloads",
                            )))
                        }
                    },
                };
                if this.writer.send_item(message).is_err() {
                    return Poll::Ready(Err(writer_gone()));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(writer_gone())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer task flushes after every message.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = this.writer.send_item(close_message(CLOSE_REASON));
                this.writer.close();
                Poll::Ready(Ok(()))
            }
            // Writer already gone; the socket is shut down either way.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "websocket writer closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_config;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn raw_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, Some(socket_config())).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, Some(socket_config())).await;
        (server, client)
    }

    fn quiet() -> FramedConfig {
        FramedConfig {
            ping_enabled: false,
            ..FramedConfig::default()
        }
    }

    #[tokio::test]
    async fn roundtrip_preserves_bytes() {
        let (server, client) = raw_pair().await;
        let mut near = FramedSocket::new(server, quiet());
        let mut far = FramedSocket::new(client, quiet());

        near.write_all(b"hello uplink").await.unwrap();

        let mut buf = [0u8; 12];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello uplink");
    }

    #[tokio::test]
    async fn large_writes_are_chunked_in_order() {
        let (server, client) = raw_pair().await;
        let mut near = FramedSocket::new(server, quiet());
        let mut far = FramedSocket::new(client, quiet());

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            near.write_all(&payload).await.unwrap();
            near
        });

        let mut buf = vec![0u8; expected.len()];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn empty_messages_are_skipped() {
        let (server, mut client) = raw_pair().await;
        let mut near = FramedSocket::new(server, quiet());

        client.send(Message::Binary(Vec::new())).await.unwrap();
        client.send(Message::Binary(b"data".to_vec())).await.unwrap();

        let mut buf = [0u8; 4];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn text_message_on_binary_channel_is_an_error() {
        let (server, mut client) = raw_pair().await;
        let mut near = FramedSocket::new(server, quiet());

        client.send(Message::Text("nope".into())).await.unwrap();

        let mut buf = [0u8; 4];
        let err = near.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn close_frame_carries_reason() {
        let (server, mut client) = raw_pair().await;
        let near = FramedSocket::new(server, quiet());

        near.close_with_reason(CLOSE_REASON).await;

        match client.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert!(frame.reason.contains("closed"));
                assert_eq!(frame.code, CloseCode::Normal);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_close_reads_as_eof() {
        let (server, mut client) = raw_pair().await;
        let mut near = FramedSocket::new(server, quiet());

        client.send(close_message("closed")).await.unwrap();

        let mut buf = [0u8; 16];
        let n = near.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_fires_once_per_period() {
        let (server, mut client) = raw_pair().await;
        let _near = FramedSocket::new(server, FramedConfig::default());

        tokio::time::advance(PING_PERIOD).await;
        match client.next().await {
            Some(Ok(Message::Ping(_))) => {}
            other => panic!("expected ping, got {other:?}"),
        }

        // No second ping before the next period elapses.
        tokio::time::advance(PING_PERIOD / 2).await;
        let early = timeout(Duration::from_millis(1), client.next()).await;
        assert!(early.is_err(), "ping fired before its period");

        tokio::time::advance(PING_PERIOD / 2).await;
        match client.next().await {
            Some(Ok(Message::Ping(_))) => {}
            other => panic!("expected second ping, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_stops_the_ping_task() {
        let (server, mut client) = raw_pair().await;
        let mut near = FramedSocket::new(server, FramedConfig::default());

        client.send(close_message("closed")).await.unwrap();

        // Observe the close frame; this is what fires the one-shot signal.
        let mut buf = [0u8; 8];
        let n = near.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        // Well past the ping period, no ping may arrive. The peer can still
        // see the close reply, so drain everything else.
        tokio::time::advance(PING_PERIOD * 2).await;
        loop {
            match timeout(Duration::from_millis(1), client.next()).await {
                Ok(Some(Ok(Message::Ping(_)))) => panic!("ping fired after peer close"),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) | Err(_) => break,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out_without_pong() {
        let (server, _client) = raw_pair().await;
        let mut near = FramedSocket::new(server, quiet());

        let mut buf = [0u8; 1];
        let err = near.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn pong_hook_observes_pongs() {
        let seen = Arc::new(AtomicBool::new(false));
        let hook = seen.clone();
        let (server, mut client) = raw_pair().await;
        let mut near = FramedSocket::new(
            server,
            FramedConfig {
                ping_enabled: false,
                pong_hook: Some(Arc::new(move |_| hook.store(true, Ordering::SeqCst))),
                ..FramedConfig::default()
            },
        );

        client.send(Message::Pong(b"pong".to_vec())).await.unwrap();
        client.send(Message::Binary(b"x".to_vec())).await.unwrap();

        let mut buf = [0u8; 1];
        near.read_exact(&mut buf).await.unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }
}
