//! End-to-end scenarios: a real hub on ephemeral ports, real agents dialed
//! through the connector, and a tonic client calling through the proxy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status};

use uplink_connector::{AgentUplink, ConnectorConfig};
use uplink_hub::{Hub, HubConfig};
use uplink_mux::MuxSession;
use uplink_proto::external::echo_client::EchoClient;
use uplink_proto::external::echo_server::{Echo, EchoServer};
use uplink_proto::external::{EchoRequest, EchoResponse};
use uplink_proto::local::hub_client::HubClient;
use uplink_proto::local::{HubActivityFeedRequest, HubListAgentsRequest};

#[derive(Default)]
struct CountingEcho {
    hits: Arc<AtomicUsize>,
}

#[tonic::async_trait]
impl Echo for CountingEcho {
    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(EchoResponse {
            payload: request.into_inner().payload,
        }))
    }

    type EchoStreamStream = ReceiverStream<Result<EchoResponse, Status>>;

    async fn echo_stream(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::EchoStreamStream>, Status> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let payload = request.into_inner().payload;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            for _ in 0..3 {
                if tx
                    .send(Ok(EchoResponse {
                        payload: payload.clone(),
                    }))
                    .await
                    .is_err()
                {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

struct TestAgent {
    session: MuxSession,
    hits: Arc<AtomicUsize>,
    server: JoinHandle<()>,
}

async fn start_hub() -> Hub {
    Hub::start(HubConfig {
        http_listen_addr: ([127, 0, 0, 1], 0).into(),
        rpc_listen_addr: ([127, 0, 0, 1], 0).into(),
        tls: None,
        shutdown_timeout: Duration::from_secs(5),
    })
    .await
    .expect("hub start")
}

async fn connect_agent(hub: &Hub, name: &str) -> TestAgent {
    let uplink = AgentUplink::connect(&ConnectorConfig {
        hub_url: format!("ws://{}/ws", hub.http_addr()),
        agent_name: name.to_string(),
        insecure_skip_verify: false,
    })
    .await
    .expect("agent connect");

    let (session, listener) = uplink.into_parts();
    let hits = Arc::new(AtomicUsize::new(0));
    let service = CountingEcho { hits: hits.clone() };
    let server = tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(EchoServer::new(service))
            .serve_with_incoming(listener)
            .await;
    });

    wait_for_registration(hub, name).await;
    TestAgent {
        session,
        hits,
        server,
    }
}

async fn wait_for_registration(hub: &Hub, name: &str) {
    timeout(Duration::from_secs(5), async {
        loop {
            if hub.registry().get(name).is_ok() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("agent {name} never registered"));
}

async fn rpc_channel(hub: &Hub) -> Channel {
    tonic::transport::Endpoint::from_shared(format!("http://{}", hub.rpc_addr()))
        .expect("endpoint")
        .connect()
        .await
        .expect("rpc connect")
}

fn echo_request(payload: Vec<u8>, name: &str) -> Request<EchoRequest> {
    let mut request = Request::new(EchoRequest { payload });
    request
        .metadata_mut()
        .insert("name", name.parse().expect("metadata value"));
    request
}

#[tokio::test]
async fn uplink_and_list_agents() {
    let hub = start_hub().await;
    let _alpha = connect_agent(&hub, "alpha").await;

    let mut client = HubClient::new(rpc_channel(&hub).await);
    let response = client
        .list_agents(Request::new(HubListAgentsRequest {}))
        .await
        .expect("list agents")
        .into_inner();

    assert_eq!(response.count, 1);
    assert_eq!(response.agents.len(), 1);
    assert_eq!(response.agents[0].name, "alpha");
    assert!(!response.agents[0].uptime.is_empty());
    assert!(!response.agents[0].connection_time.is_empty());

    hub.close().await;
}

#[tokio::test]
async fn proxy_reaches_the_named_agent_only() {
    let hub = start_hub().await;
    let alpha = connect_agent(&hub, "alpha").await;
    let beta = connect_agent(&hub, "beta").await;

    // Every byte value, to prove the hub forwards payloads untouched.
    let payload: Vec<u8> = (0..=255u8).collect();

    let mut client = EchoClient::new(rpc_channel(&hub).await);
    let response = client
        .echo(echo_request(payload.clone(), "beta"))
        .await
        .expect("proxied echo")
        .into_inner();

    assert_eq!(response.payload, payload);
    assert_eq!(beta.hits.load(Ordering::SeqCst), 1);
    assert_eq!(alpha.hits.load(Ordering::SeqCst), 0);

    hub.close().await;
}

#[tokio::test]
async fn proxy_to_unknown_agent_is_a_precondition_failure() {
    let hub = start_hub().await;
    let _alpha = connect_agent(&hub, "alpha").await;

    let mut client = EchoClient::new(rpc_channel(&hub).await);
    let err = client
        .echo(echo_request(b"hello".to_vec(), "gamma"))
        .await
        .expect_err("gamma is not connected");

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.message().contains("not found"), "got: {}", err.message());

    hub.close().await;
}

#[tokio::test]
async fn proxy_without_name_metadata_is_a_precondition_failure() {
    let hub = start_hub().await;
    let _alpha = connect_agent(&hub, "alpha").await;

    let mut client = EchoClient::new(rpc_channel(&hub).await);
    let err = client
        .echo(Request::new(EchoRequest {
            payload: b"hello".to_vec(),
        }))
        .await
        .expect_err("no name metadata attached");

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(
        err.message().contains("name not found"),
        "got: {}",
        err.message()
    );

    hub.close().await;
}

#[tokio::test]
async fn unknown_method_prefix_is_unimplemented() {
    let hub = start_hub().await;

    // An Echo client pointed at an unreserved package name: same framing,
    // wrong prefix.
    let channel = rpc_channel(&hub).await;
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.expect("channel ready");
    let codec = tonic::codec::ProstCodec::<EchoRequest, EchoResponse>::default();
    let path = tonic::codegen::http::uri::PathAndQuery::from_static("/other.Echo/Echo");
    let err = grpc
        .unary(
            Request::new(EchoRequest {
                payload: Vec::new(),
            }),
            path,
            codec,
        )
        .await
        .expect_err("prefix is not reserved");

    assert_eq!(err.code(), Code::Unimplemented);

    hub.close().await;
}

#[tokio::test]
async fn duplicate_registration_loses_and_is_disconnected() {
    let hub = start_hub().await;
    let _first = connect_agent(&hub, "alpha").await;

    // The second uplink under the same name connects at the WebSocket level
    // but is told to go away: its session dies and nothing is registered
    // over the incumbent.
    let second = AgentUplink::connect(&ConnectorConfig {
        hub_url: format!("ws://{}/ws", hub.http_addr()),
        agent_name: "alpha".to_string(),
        insecure_skip_verify: false,
    })
    .await
    .expect("websocket handshake still succeeds");

    timeout(Duration::from_secs(5), second.closed())
        .await
        .expect("rejected uplink should be closed by the hub");
    assert_eq!(hub.registry().count(), 1);

    hub.close().await;
}

#[tokio::test]
async fn agent_disconnect_unregisters_and_breaks_proxying() {
    let hub = start_hub().await;
    let alpha = connect_agent(&hub, "alpha").await;

    alpha.session.close();
    alpha.server.abort();

    timeout(Duration::from_secs(5), async {
        loop {
            if hub.registry().count() == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnect should unregister alpha");

    let mut client = EchoClient::new(rpc_channel(&hub).await);
    let err = client
        .echo(echo_request(b"hello".to_vec(), "alpha"))
        .await
        .expect_err("alpha is gone");
    assert_eq!(err.code(), Code::FailedPrecondition);

    hub.close().await;
}

#[tokio::test]
async fn activity_feed_streams_connection_events() {
    let hub = start_hub().await;

    let mut client = HubClient::new(rpc_channel(&hub).await);
    let mut events = client
        .stream_activity_feed(Request::new(HubActivityFeedRequest {}))
        .await
        .expect("subscribe")
        .into_inner();

    let _agent = connect_agent(&hub, "gamma").await;

    let event = timeout(Duration::from_secs(5), events.next())
        .await
        .expect("feed event within deadline")
        .expect("stream still open")
        .expect("event ok");
    assert!(
        event.message.contains("gamma"),
        "unexpected event: {}",
        event.message
    );

    hub.close().await;
}

#[tokio::test]
async fn health_reports_uptime_and_request_id() {
    let hub = start_hub().await;

    let mut stream = tokio::net::TcpStream::connect(hub.http_addr())
        .await
        .expect("connect http listener");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: hub\r\nConnection: close\r\n\r\n")
        .await
        .expect("send request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("uptime:"), "got: {response}");
    assert!(
        response.to_ascii_lowercase().contains("x-request-id"),
        "got: {response}"
    );

    hub.close().await;
}

#[tokio::test]
async fn graceful_shutdown_drains_inflight_streams() {
    let hub = Arc::new(start_hub().await);
    let _alpha = connect_agent(&hub, "alpha").await;

    let mut client = EchoClient::new(rpc_channel(&hub).await);
    let mut stream = client
        .echo_stream(echo_request(b"tick".to_vec(), "alpha"))
        .await
        .expect("start streaming call")
        .into_inner();

    // First item in hand, then shut down with the call still in flight.
    let first = stream.next().await.expect("first item").expect("item ok");
    assert_eq!(first.payload, b"tick");

    let closer = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.close().await })
    };

    let mut received = 1;
    while let Some(item) = stream.next().await {
        if item.is_err() {
            break;
        }
        received += 1;
    }
    assert!(
        received >= 2,
        "in-flight stream should drain past the shutdown signal"
    );

    timeout(Duration::from_secs(10), closer)
        .await
        .expect("close finishes within its deadline")
        .expect("close task");

    // Repeated close is a no-op.
    timeout(Duration::from_secs(1), hub.close())
        .await
        .expect("second close returns immediately");

    // The listeners are gone.
    assert!(tokio::net::TcpStream::connect(hub.rpc_addr()).await.is_err());
}
