//! Hub-native RPC services: agent enumeration and the activity feed stream.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use uplink_control::{AgentRegistry, Feed};
use uplink_proto::local::hub_server::{Hub, HubServer};
use uplink_proto::local::{
    ActivityEvent, AgentInfo, HubActivityFeedRequest, HubListAgentsRequest, HubListAgentsResponse,
};

/// Implementation of the `local.Hub` service.
#[derive(Clone)]
pub struct HubApi {
    registry: Arc<AgentRegistry>,
    feed: Feed,
}

impl HubApi {
    pub fn new(registry: Arc<AgentRegistry>, feed: Feed) -> Self {
        Self { registry, feed }
    }

    pub fn server(self) -> HubServer<HubApi> {
        HubServer::new(self)
    }
}

#[tonic::async_trait]
impl Hub for HubApi {
    async fn list_agents(
        &self,
        _request: Request<HubListAgentsRequest>,
    ) -> Result<Response<HubListAgentsResponse>, Status> {
        let now = Utc::now();
        let agents: Vec<AgentInfo> = self
            .registry
            .list()
            .into_iter()
            .map(|agent| AgentInfo {
                name: agent.name.clone(),
                connection_time: agent.connected_at.to_rfc3339(),
                uptime: format_duration(now.signed_duration_since(agent.connected_at)),
            })
            .collect();

        Ok(Response::new(HubListAgentsResponse {
            count: agents.len() as i64,
            agents,
        }))
    }

    type StreamActivityFeedStream = ReceiverStream<Result<ActivityEvent, Status>>;

    async fn stream_activity_feed(
        &self,
        _request: Request<HubActivityFeedRequest>,
    ) -> Result<Response<Self::StreamActivityFeedStream>, Status> {
        let mut subscription = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if tx.send(Ok(ActivityEvent { message })).await.is_err() {
                    // Client went away; dropping the subscription fires its
                    // quit signal and the router prunes it.
                    debug!("activity feed subscriber disconnected");
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Render an uptime the way operators expect: `2h45m10s`, `3m2.250s`, `41s`.
pub(crate) fn format_duration(d: chrono::Duration) -> String {
    let millis = d.num_milliseconds().max(0);
    let hours = millis / 3_600_000;
    let minutes = (millis % 3_600_000) / 60_000;
    let seconds = (millis % 60_000) / 1000;
    let fraction = millis % 1000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if fraction > 0 {
        out.push_str(&format!("{seconds}.{fraction:03}s"));
    } else {
        out.push_str(&format!("{seconds}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio_util::sync::CancellationToken;
    use uplink_control::FeedRouter;

    fn api() -> (HubApi, FeedRouter, Arc<AgentRegistry>) {
        let registry = Arc::new(AgentRegistry::new());
        let (feed, router) = Feed::new();
        (HubApi::new(registry.clone(), feed), router, registry)
    }

    #[test]
    fn durations_render_like_uptimes() {
        assert_eq!(format_duration(Duration::seconds(41)), "41s");
        assert_eq!(format_duration(Duration::seconds(182)), "3m2s");
        assert_eq!(format_duration(Duration::milliseconds(182_250)), "3m2.250s");
        assert_eq!(
            format_duration(Duration::seconds(2 * 3600 + 45 * 60 + 10)),
            "2h45m10s"
        );
        assert_eq!(format_duration(Duration::seconds(-5)), "0s");
    }

    #[tokio::test]
    async fn list_agents_reports_empty_registry() {
        let (api, _router, _registry) = api();
        let response = api
            .list_agents(Request::new(HubListAgentsRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.count, 0);
        assert!(response.agents.is_empty());
    }

    #[tokio::test]
    async fn activity_stream_receives_published_messages() {
        let (api, router, _registry) = api();
        let shutdown = CancellationToken::new();
        let router_task = tokio::spawn(router.run(shutdown.clone()));

        let feed = api.feed.clone();
        let mut stream = api
            .stream_activity_feed(Request::new(HubActivityFeedRequest {}))
            .await
            .unwrap()
            .into_inner()
            .into_inner();

        feed.publish("agent alpha connected").unwrap();

        let event = stream.recv().await.unwrap().unwrap();
        assert_eq!(event.message, "agent alpha connected");

        shutdown.cancel();
        router_task.await.unwrap();
    }
}
