//! Process-wide activity feed.
//!
//! One ingress channel fans out to every current subscriber through a router
//! task. Delivery is synchronous: the router waits for each subscriber to
//! take a message before accepting the next ingress, so back-pressure reaches
//! producers end-to-end. Subscribers leave by dropping their subscription,
//! which fires a per-subscriber quit signal; the router prunes them lazily.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Publish-side errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The router is gone or still busy delivering; the message was dropped.
    #[error("activity feed router is unavailable")]
    RouterUnavailable,
}

struct Subscriber {
    tx: mpsc::Sender<String>,
    quit: CancellationToken,
}

/// Publish/subscribe handle to the feed. Cheap to clone.
#[derive(Clone)]
pub struct Feed {
    ingress: mpsc::Sender<String>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

/// The delivery half returned by [`Feed::new`]; run it as its own task.
pub struct FeedRouter {
    ingress: mpsc::Receiver<String>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

/// A live subscription. Dropping it (or calling [`close`](Self::close))
/// fires the quit signal and releases the subscriber slot.
pub struct FeedSubscription {
    rx: mpsc::Receiver<String>,
    quit: CancellationToken,
}

impl Feed {
    pub fn new() -> (Feed, FeedRouter) {
        let (ingress_tx, ingress_rx) = mpsc::channel(1);
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        (
            Feed {
                ingress: ingress_tx,
                subscribers: subscribers.clone(),
            },
            FeedRouter {
                ingress: ingress_rx,
                subscribers,
            },
        )
    }

    /// Hand a message to the router without blocking the caller.
    pub fn publish(&self, message: impl Into<String>) -> Result<(), FeedError> {
        self.ingress
            .try_send(message.into())
            .map_err(|_| FeedError::RouterUnavailable)
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> FeedSubscription {
        let (tx, rx) = mpsc::channel(1);
        let quit = CancellationToken::new();
        self.subscribers.lock().unwrap().push(Subscriber {
            tx,
            quit: quit.clone(),
        });
        FeedSubscription { rx, quit }
    }
}

impl FeedSubscription {
    /// Next feed message, or `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Explicitly end the subscription.
    pub fn close(&self) {
        self.quit.cancel();
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.quit.cancel();
    }
}

impl FeedRouter {
    /// Replicate every ingress message to each live subscriber until
    /// `shutdown` fires or all publish handles are gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.ingress.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            // Snapshot under the lock, deliver outside it.
            let targets: Vec<(mpsc::Sender<String>, CancellationToken)> = {
                let mut subscribers = self.subscribers.lock().unwrap();
                subscribers.retain(|s| !s.quit.is_cancelled());
                subscribers
                    .iter()
                    .map(|s| (s.tx.clone(), s.quit.clone()))
                    .collect()
            };

            for (tx, quit) in targets {
                tokio::select! {
                    delivered = tx.send(message.clone()) => {
                        if delivered.is_err() {
                            quit.cancel();
                        }
                    }
                    _ = quit.cancelled() => {}
                }
            }
        }
        debug!("activity feed router stopped");
    }
}
