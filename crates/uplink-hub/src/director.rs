//! RPC listener and method-name director.
//!
//! The hub cannot know the schemas of the services its agents expose, so the
//! RPC listener is served at the HTTP/2 layer: `local.*` requests are handed
//! to the in-process tonic services, `external.*` requests are spliced onto a
//! fresh substream toward the agent named in the call metadata, with bodies
//! and trailers streaming through untouched in both directions. Statuses the
//! director produces itself are emitted as trailers-only gRPC responses; it
//! never rewrites statuses produced by an agent.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{header, HeaderValue, Request, Response, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tower::Service;
use tracing::{debug, info, warn};

use uplink_control::{AgentRegistry, Feed};
use uplink_proto::local::hub_server::HubServer;

use crate::services::HubApi;

/// Method prefix reserved for hub-native services.
pub const LOCAL_PREFIX: &str = "/local.";

/// Method prefix reserved for proxied services.
pub const EXTERNAL_PREFIX: &str = "/external.";

/// Metadata key naming the target agent of a proxied call.
pub const NAME_METADATA_KEY: &str = "name";

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Routes each incoming RPC by its fully-qualified method name.
#[derive(Clone)]
pub struct Director {
    registry: Arc<AgentRegistry>,
    local: HubServer<HubApi>,
}

impl Director {
    pub fn new(registry: Arc<AgentRegistry>, feed: Feed) -> Self {
        let local = HubApi::new(registry.clone(), feed).server();
        Self { registry, local }
    }

    /// Dispatch one call. Never fails at the HTTP layer; every error becomes
    /// a gRPC status response.
    pub async fn route<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: http_body::Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError> + Send + 'static,
    {
        let path = req.uri().path().to_string();

        if path.starts_with(EXTERNAL_PREFIX) {
            return match self.proxy(&path, req).await {
                Ok(res) => res,
                Err(status) => status_response(&status),
            };
        }

        if path.starts_with(LOCAL_PREFIX) {
            if path.starts_with(local_hub_prefix().as_str()) {
                let mut local = self.local.clone();
                return match local.call(req).await {
                    Ok(res) => res.map(|body| body.map_err(Into::into).boxed_unsync()),
                    Err(never) => match never {},
                };
            }
            // Residual local.* method no in-process service answers for.
            return status_response(&Status::unimplemented("unknown method"));
        }

        status_response(&Status::unimplemented("unknown method"))
    }

    async fn proxy<B>(&self, path: &str, req: Request<B>) -> Result<Response<ProxyBody>, Status>
    where
        B: http_body::Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError> + Send + 'static,
    {
        let name = match req.headers().get(NAME_METADATA_KEY) {
            Some(value) => value
                .to_str()
                .map_err(|_| Status::failed_precondition("no metadata provided"))?
                .to_string(),
            None => return Err(Status::failed_precondition("name not found in metadata")),
        };
        if name.is_empty() {
            return Err(Status::failed_precondition("name not found in metadata"));
        }

        let agent = self
            .registry
            .get(&name)
            .map_err(|e| Status::failed_precondition(e.to_string()))?;

        let substream = agent
            .open_stream()
            .await
            .map_err(|e| Status::internal(format!("open substream to {name}: {e}")))?;

        info!(method = %path, agent = %name, "proxying rpc request");

        let (mut sender, connection) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(substream))
                .await
                .map_err(|e| Status::internal(format!("substream handshake with {name}: {e}")))?;

        // The connection driver lives as long as the call; dropping the
        // response tears it down and closes the substream with it.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("proxied substream connection ended: {e}");
            }
        });

        let (mut parts, body) = req.into_parts();
        parts.uri = substream_uri(&parts.uri, &name);
        let outbound = Request::from_parts(parts, body);

        let response = sender
            .send_request(outbound)
            .await
            .map_err(|e| Status::unavailable(format!("agent {name} request failed: {e}")))?;

        Ok(response.map(|body| body.map_err(Into::into).boxed_unsync()))
    }
}

/// `/local.Hub/`: calls under it are dispatched to the in-process service,
/// which answers for its own unknown methods.
fn local_hub_prefix() -> String {
    use tonic::server::NamedService;
    format!("/{}/", HubServer::<HubApi>::NAME)
}

/// Rebuild the request URI for the agent-side connection. The authority is
/// cosmetic; the substream already points at the right peer.
fn substream_uri(original: &Uri, name: &str) -> Uri {
    let path_and_query = original
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let mut parts = http::uri::Parts::default();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority =
        Some(Authority::try_from(name).unwrap_or_else(|_| Authority::from_static("agent")));
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).unwrap_or_else(|_| original.clone())
}

/// A trailers-only gRPC response: HTTP 200 with the status carried in the
/// initial header block and an empty body.
fn status_response(status: &Status) -> Response<ProxyBody> {
    let mut res = Response::new(empty_body());
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    res.headers_mut()
        .insert("grpc-status", HeaderValue::from(status.code() as i32));
    if !status.message().is_empty() {
        if let Ok(value) = HeaderValue::from_str(&percent_encode(status.message())) {
            res.headers_mut().insert("grpc-message", value);
        }
    }
    res
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Percent-encoding for `grpc-message`: printable ASCII minus `%` passes
/// through, everything else becomes `%XX`.
fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for &byte in message.as_bytes() {
        match byte {
            b'%' => out.push_str("%25"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Serve the RPC listener until `shutdown` fires, then drain in-flight calls
/// within `drain_timeout`.
pub async fn serve(
    listener: TcpListener,
    director: Director,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    let graceful = GracefulShutdown::new();

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("rpc accept failed: {e}");
                    continue;
                }
            },
        };
        debug!(remote = %remote, "rpc connection accepted");

        let per_conn = director.clone();
        let service = service_fn(move |req| {
            let director = per_conn.clone();
            async move { Ok::<_, Infallible>(director.route(req).await) }
        });

        let connection = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service);
        let watched = graceful.watch(connection);
        tokio::spawn(async move {
            if let Err(e) = watched.await {
                debug!("rpc connection ended: {e}");
            }
        });
    }

    drop(listener);
    info!("rpc server is shutting down");
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(drain_timeout) => {
            warn!("rpc drain deadline elapsed; dropping remaining calls");
        }
    }
}

/// Decode a `grpc-status` header produced by [`status_response`].
pub fn status_code_from_headers(headers: &http::HeaderMap) -> Option<Code> {
    let raw = headers.get("grpc-status")?.to_str().ok()?;
    let value: i32 = raw.parse().ok()?;
    Some(Code::from_i32(value))
}
