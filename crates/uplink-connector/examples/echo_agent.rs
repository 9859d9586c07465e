//! A minimal agent: connects to a hub and serves the `external.Echo`
//! service over its uplink.
//!
//! ```sh
//! cargo run --example echo_agent -- --hub ws://127.0.0.1:8080/ws --name alpha
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::info;
use tracing_subscriber::EnvFilter;

use uplink_connector::{AgentUplink, ConnectorConfig};
use uplink_proto::external::echo_server::{Echo, EchoServer};
use uplink_proto::external::{EchoRequest, EchoResponse};

#[derive(Parser, Debug)]
struct Args {
    /// Hub uplink URL
    #[arg(long, env = "HUB_URL", default_value = "ws://127.0.0.1:8080/ws")]
    hub: String,

    /// Name to register under
    #[arg(long, env = "HUB_AGENT_NAME")]
    name: String,

    /// Skip TLS certificate verification (development only)
    #[arg(long)]
    insecure: bool,
}

#[derive(Default)]
struct EchoApi;

#[tonic::async_trait]
impl Echo for EchoApi {
    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse {
            payload: request.into_inner().payload,
        }))
    }

    type EchoStreamStream = ReceiverStream<Result<EchoResponse, Status>>;

    async fn echo_stream(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::EchoStreamStream>, Status> {
        let payload = request.into_inner().payload;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            for _ in 0..3 {
                if tx.send(Ok(EchoResponse { payload: payload.clone() })).await.is_err() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let uplink = AgentUplink::connect(&ConnectorConfig {
        hub_url: args.hub.clone(),
        agent_name: args.name.clone(),
        insecure_skip_verify: args.insecure,
    })
    .await
    .context("failed to connect to hub")?;

    info!(name = %args.name, hub = %args.hub, "serving echo over the uplink");
    let (_session, listener) = uplink.into_parts();

    tonic::transport::Server::builder()
        .add_service(EchoServer::new(EchoApi))
        .serve_with_incoming(listener)
        .await
        .context("rpc server failed")?;
    Ok(())
}
