//! Session handle, accept-side listener and the connection driver.

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{MuxError, MuxStream};

type OpenReply = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;

/// Which side of the session this endpoint plays.
///
/// The role is independent of who connected to whom: over an uplink the hub
/// is the [`Dial`](MuxMode::Dial) side even though the agent dialed the
/// WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxMode {
    /// Opens substreams on demand.
    Dial,
    /// Receives substreams opened by the peer.
    Accept,
}

impl From<MuxMode> for yamux::Mode {
    fn from(mode: MuxMode) -> Self {
        match mode {
            MuxMode::Dial => yamux::Mode::Client,
            MuxMode::Accept => yamux::Mode::Server,
        }
    }
}

/// Handle to a running session.
///
/// Cloneable via `Arc` by callers; dropping every handle (and the listener)
/// shuts the session down.
pub struct MuxSession {
    cmd_tx: mpsc::Sender<OpenReply>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MuxSession {
    /// Start a session over `io` and return the handle together with the
    /// listener for peer-opened substreams. A dial-side endpoint that never
    /// serves inbound substreams may simply drop the listener.
    pub fn new<I>(io: I, mode: MuxMode) -> (Self, MuxListener)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = yamux::Connection::new(io.compat(), yamux::Config::default(), mode.into());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        tokio::spawn(drive(
            connection,
            cmd_rx,
            inbound_tx,
            shutdown.clone(),
            closed.clone(),
        ));

        (
            Self {
                cmd_tx,
                shutdown,
                closed,
            },
            MuxListener { rx: inbound_rx },
        )
    }

    /// Open a new outbound substream.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(reply_tx)
            .await
            .map_err(|_| MuxError::SessionClosed)?;
        let stream = reply_rx.await.map_err(|_| MuxError::SessionClosed)??;
        Ok(MuxStream::new(stream))
    }

    /// Ask the driver to close the session. Safe to call more than once.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves when the session has terminated, for any reason. Latched:
    /// fires exactly once and stays set.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        // The handle is the only way to open substreams; once it is gone the
        // driver has nothing left to serve and closes the conduit.
        self.shutdown.cancel();
    }
}

/// Accept side of a session: a stream of peer-opened substreams, shaped for
/// use as an RPC server's incoming connections.
pub struct MuxListener {
    rx: mpsc::UnboundedReceiver<yamux::Stream>,
}

impl std::fmt::Debug for MuxListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxListener").finish()
    }
}

impl Stream for MuxListener {
    type Item = io::Result<MuxStream>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|stream| stream.map(|s| Ok(MuxStream::new(s))))
    }
}

/// Driver task. Owns the yamux connection: serves open requests, forwards
/// inbound substreams, and latches the close signal on exit.
async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut cmd_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::UnboundedSender<yamux::Stream>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) where
    T: futures_util::AsyncRead + futures_util::AsyncWrite + Unpin + Send + 'static,
{
    let mut pending_open: Option<OpenReply> = None;
    let mut cmds_open = true;
    let shutdown_fut = shutdown.cancelled();
    tokio::pin!(shutdown_fut);

    poll_fn::<(), _>(|cx| {
        if shutdown_fut.as_mut().poll(cx).is_ready() {
            return match connection.poll_close(cx) {
                Poll::Ready(res) => {
                    if let Err(e) = res {
                        debug!("session close failed: {e}");
                    }
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            };
        }

        loop {
            if pending_open.is_none() && cmds_open {
                match cmd_rx.poll_recv(cx) {
                    Poll::Ready(Some(reply)) => pending_open = Some(reply),
                    Poll::Ready(None) => cmds_open = false,
                    Poll::Pending => {}
                }
            }

            if pending_open.is_some() {
                if let Poll::Ready(opened) = connection.poll_new_outbound(cx) {
                    trace!("opened outbound substream");
                    let reply = pending_open.take().expect("pending open request");
                    let _ = reply.send(opened);
                    continue;
                }
            }

            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    // The dial side drops its listener; inbound substreams
                    // from the peer are discarded there.
                    if inbound_tx.send(stream).is_err() {
                        trace!("dropping inbound substream: no listener");
                    }
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!("session failed: {e}");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    debug!("session ended");
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    closed.cancel();
}
