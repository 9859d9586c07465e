//! Lifecycle supervisor: owns the two listeners and the registry, starts
//! them, and coordinates a bounded graceful shutdown.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use uplink_control::{AgentRegistry, Feed};

use crate::director::{self, Director};
use crate::uplink::{self, HubState};

/// Default graceful-shutdown deadline.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS material for the uplink listener. The agent hop does not require
/// encryption; operators terminate TLS here when they want it.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address of the HTTP listener (`/ws`, `/health`).
    pub http_listen_addr: SocketAddr,
    /// Address of the RPC listener.
    pub rpc_listen_addr: SocketAddr,
    /// Optional TLS material for the HTTP listener.
    pub tls: Option<TlsSettings>,
    /// Deadline applied to draining each listener during `close`.
    pub shutdown_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            http_listen_addr: ([0, 0, 0, 0], 8080).into(),
            rpc_listen_addr: ([0, 0, 0, 0], 9090).into(),
            tls: None,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

/// Start-up errors. All of them are fatal; after start the hub only stops
/// through [`Hub::close`].
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("failed to load tls material: {0}")]
    Tls(io::Error),

    #[error("listener setup failed: {0}")]
    Io(#[from] io::Error),
}

struct HubTasks {
    http: JoinHandle<()>,
    rpc: JoinHandle<()>,
    feed_router: JoinHandle<()>,
}

/// A running hub.
pub struct Hub {
    registry: Arc<AgentRegistry>,
    http_addr: SocketAddr,
    rpc_addr: SocketAddr,
    healthy: Arc<AtomicBool>,
    shutdown: CancellationToken,
    done: CancellationToken,
    tasks: tokio::sync::Mutex<Option<HubTasks>>,
    shutdown_timeout: Duration,
}

impl Hub {
    /// Bind both listeners and start serving. Bind failures are returned;
    /// nothing is left running on error.
    pub async fn start(config: HubConfig) -> Result<Hub, HubError> {
        let registry = Arc::new(AgentRegistry::new());
        let (feed, feed_router) = Feed::new();
        let healthy = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let state = Arc::new(HubState {
            registry: registry.clone(),
            feed: feed.clone(),
            started: Instant::now(),
            healthy: healthy.clone(),
        });

        // HTTP listener, bound up front so failures are fatal at start-up.
        let http_std = std::net::TcpListener::bind(config.http_listen_addr).map_err(|e| {
            HubError::Bind {
                listener: "http",
                addr: config.http_listen_addr,
                source: e,
            }
        })?;
        http_std.set_nonblocking(true)?;
        let http_addr = http_std.local_addr()?;

        // RPC listener.
        let rpc_listener = tokio::net::TcpListener::bind(config.rpc_listen_addr)
            .await
            .map_err(|e| HubError::Bind {
                listener: "rpc",
                addr: config.rpc_listen_addr,
                source: e,
            })?;
        let rpc_addr = rpc_listener.local_addr()?;

        let feed_router_task = tokio::spawn(feed_router.run(shutdown.clone()));

        let app = uplink::router(state);
        let http_task = match &config.tls {
            None => {
                let listener = tokio::net::TcpListener::from_std(http_std)?;
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    info!("http server listening on {http_addr}");
                    let serve = axum::serve(
                        listener,
                        app.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .with_graceful_shutdown(async move { signal.cancelled().await });
                    if let Err(e) = serve.await {
                        error!("http server error: {e}");
                    }
                })
            }
            Some(tls) => {
                let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .map_err(HubError::Tls)?;
                let handle = axum_server::Handle::new();
                let watcher = handle.clone();
                let signal = shutdown.clone();
                let grace = config.shutdown_timeout;
                tokio::spawn(async move {
                    signal.cancelled().await;
                    watcher.graceful_shutdown(Some(grace));
                });
                tokio::spawn(async move {
                    info!("https server listening on {http_addr}");
                    let serve = axum_server::from_tcp_rustls(http_std, rustls_config)
                        .handle(handle)
                        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
                    if let Err(e) = serve.await {
                        error!("https server error: {e}");
                    }
                })
            }
        };

        info!("rpc server listening on {rpc_addr}");
        let director = Director::new(registry.clone(), feed);
        let rpc_task = tokio::spawn(director::serve(
            rpc_listener,
            director,
            shutdown.clone(),
            config.shutdown_timeout,
        ));

        Ok(Hub {
            registry,
            http_addr,
            rpc_addr,
            healthy,
            shutdown,
            done: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Some(HubTasks {
                http: http_task,
                rpc: rpc_task,
                feed_router: feed_router_task,
            })),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Address the HTTP listener actually bound.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Address the RPC listener actually bound.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Graceful shutdown. Idempotent: the first caller drains, later callers
    /// wait for it to finish.
    pub async fn close(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let tasks = self.tasks.lock().await.take();
        let Some(tasks) = tasks else {
            self.done.cancelled().await;
            return;
        };

        info!("hub is shutting down");
        let HubTasks {
            mut http,
            mut rpc,
            feed_router,
        } = tasks;

        let drain = async {
            if let Err(e) = (&mut http).await {
                warn!("http server task failed: {e}");
            }
            if let Err(e) = (&mut rpc).await {
                warn!("rpc server task failed: {e}");
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("shutdown deadline elapsed; terminating stragglers");
            http.abort();
            rpc.abort();
        }

        // Surviving uplink sessions are closed so each per-agent supervisor
        // unregisters its name.
        for agent in self.registry.list() {
            agent.session().close();
        }

        let _ = feed_router.await;
        self.done.cancel();
        info!("hub stopped");
    }
}
