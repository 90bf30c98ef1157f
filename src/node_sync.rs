use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, header};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::models::{Node, NodeStatus};
use crate::version::VERSION;
use crate::xray::config::EngineConfig;
use crate::xray::stats::Counter;

const APP_NAME: &str = "shadowsocks-hub";

#[derive(Error, Debug)]
pub enum NodeSyncError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Node returned non-success status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Invalid node response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Which path, if any, delivered a config to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Direct,
    Proxied,
    Failed,
}

impl PushOutcome {
    /// The node status an outcome implies, whatever the node's previous status.
    pub fn status(self) -> NodeStatus {
        match self {
            PushOutcome::Direct => NodeStatus::Available,
            PushOutcome::Proxied => NodeStatus::Dirty,
            PushOutcome::Failed => NodeStatus::Unavailable,
        }
    }
}

/// Delivers configs to remote nodes and pulls their traffic counters.
#[async_trait]
pub trait NodeSync: Send + Sync {
    /// Pushes `config`, falling back once through `proxy` when set.
    async fn push(&self, node: &Node, config: &EngineConfig, proxy: Option<&str>) -> PushOutcome;

    async fn fetch_stats(&self, node: &Node, proxy: Option<&str>) -> Result<Vec<Counter>, NodeSyncError>;
}

pub fn proxied_url(proxy: &str, url: &str) -> String {
    format!("{}/?url={}", proxy.trim_end_matches('/'), urlencoding::encode(url))
}

pub struct HttpNodeSync {
    client: Client,
}

impl HttpNodeSync {
    pub fn new(timeout: Duration) -> Result<Self, NodeSyncError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn node_url(node: &Node, path: &str) -> String {
        format!("http://{}:{}{}", node.host, node.http_port, path)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&EngineConfig>,
    ) -> Result<String, NodeSyncError> {
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-App-Name", APP_NAME)
            .header("X-App-Version", VERSION);
        if let Some(config) = body {
            request = request.json(config);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(NodeSyncError::Status { status, body: text });
        }
        Ok(text)
    }

    /// Tries the node directly, then once through the proxy. The flag tells
    /// whether the proxy path was the one that answered.
    async fn send_with_fallback(
        &self,
        method: Method,
        node: &Node,
        path: &str,
        body: Option<&EngineConfig>,
        proxy: Option<&str>,
    ) -> Result<(String, bool), NodeSyncError> {
        let url = Self::node_url(node, path);
        let direct_err = match self.send(method.clone(), &url, &node.http_token, body).await {
            Ok(text) => return Ok((text, false)),
            Err(e) => e,
        };

        let Some(proxy) = proxy else {
            return Err(direct_err);
        };
        debug!(node_id = node.id, error = %direct_err, "Direct request failed, trying the proxy.");
        let text = self
            .send(method, &proxied_url(proxy, &url), &node.http_token, body)
            .await?;
        Ok((text, true))
    }
}

#[async_trait]
impl NodeSync for HttpNodeSync {
    async fn push(&self, node: &Node, config: &EngineConfig, proxy: Option<&str>) -> PushOutcome {
        match self
            .send_with_fallback(Method::POST, node, "/v1/configs", Some(config), proxy)
            .await
        {
            Ok((_, false)) => {
                debug!(node_id = node.id, "Config pushed to node.");
                PushOutcome::Direct
            }
            Ok((_, true)) => {
                warn!(node_id = node.id, "Config pushed to node through the proxy.");
                PushOutcome::Proxied
            }
            Err(e) => {
                warn!(node_id = node.id, host = %node.host, error = %e, "Cannot push config to node.");
                PushOutcome::Failed
            }
        }
    }

    async fn fetch_stats(&self, node: &Node, proxy: Option<&str>) -> Result<Vec<Counter>, NodeSyncError> {
        let (text, _) = self
            .send_with_fallback(Method::GET, node, "/v1/stats", None, proxy)
            .await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const TOKEN: &str = "node-secret";

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TOKEN}"))
    }

    async fn fake_node() -> u16 {
        let router = Router::new()
            .route(
                "/v1/configs",
                post(|headers: HeaderMap, Json(config): Json<EngineConfig>| async move {
                    if !authorized(&headers) {
                        return StatusCode::UNAUTHORIZED;
                    }
                    assert!(config.api_port().is_some());
                    StatusCode::OK
                }),
            )
            .route(
                "/v1/stats",
                get(|headers: HeaderMap| async move {
                    if !authorized(&headers) {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    Ok(Json(vec![
                        Counter::new("user>>>1>>>traffic>>>uplink", 10),
                        Counter::new("inbound>>>direct>>>traffic>>>downlink", 20),
                    ]))
                }),
            );
        serve(router).await
    }

    async fn fake_proxy(seen: Arc<Mutex<Vec<String>>>) -> u16 {
        let record = |State(seen): State<Arc<Mutex<Vec<String>>>>,
                      headers: HeaderMap,
                      Query(query): Query<HashMap<String, String>>| async move {
            if !authorized(&headers) {
                return StatusCode::UNAUTHORIZED;
            }
            seen.lock().unwrap().push(query.get("url").cloned().unwrap_or_default());
            StatusCode::OK
        };
        let stats = |State(seen): State<Arc<Mutex<Vec<String>>>>,
                     headers: HeaderMap,
                     Query(query): Query<HashMap<String, String>>| async move {
            if !authorized(&headers) {
                return Err(StatusCode::UNAUTHORIZED);
            }
            seen.lock().unwrap().push(query.get("url").cloned().unwrap_or_default());
            Ok(Json(vec![Counter::new("user>>>2>>>traffic>>>downlink", 30)]))
        };
        let router = Router::new().route("/", post(record).get(stats)).with_state(seen);
        serve(router).await
    }

    fn closed_port() -> u16 {
        crate::ports::PortAllocator::new().allocate().unwrap()
    }

    fn sync() -> HttpNodeSync {
        HttpNodeSync::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_outcome_to_status() {
        assert_eq!(PushOutcome::Direct.status(), NodeStatus::Available);
        assert_eq!(PushOutcome::Proxied.status(), NodeStatus::Dirty);
        assert_eq!(PushOutcome::Failed.status(), NodeStatus::Unavailable);
    }

    #[test]
    fn test_proxied_url_encodes_target() {
        assert_eq!(
            proxied_url("http://proxy:8080/", "http://1.2.3.4:80/v1/configs"),
            "http://proxy:8080/?url=http%3A%2F%2F1.2.3.4%3A80%2Fv1%2Fconfigs"
        );
    }

    #[tokio::test]
    async fn test_direct_push() {
        let port = fake_node().await;
        let node = Node::new(1, "127.0.0.1", port, TOKEN);
        let config = EngineConfig::skeleton("warning", 3411);
        assert_eq!(sync().push(&node, &config, None).await, PushOutcome::Direct);
    }

    #[tokio::test]
    async fn test_wrong_token_without_proxy_fails() {
        let port = fake_node().await;
        let node = Node::new(1, "127.0.0.1", port, "wrong");
        let config = EngineConfig::skeleton("warning", 3411);
        assert_eq!(sync().push(&node, &config, None).await, PushOutcome::Failed);
    }

    #[tokio::test]
    async fn test_proxy_fallback_marks_push_proxied() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let proxy_port = fake_proxy(seen.clone()).await;
        let node_port = closed_port();
        let node = Node::new(4, "127.0.0.1", node_port, TOKEN);
        let config = EngineConfig::skeleton("warning", 3411);
        let proxy = format!("http://127.0.0.1:{proxy_port}");

        let outcome = sync().push(&node, &config, Some(&proxy)).await;
        assert_eq!(outcome, PushOutcome::Proxied);
        assert_eq!(outcome.status(), NodeStatus::Dirty);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [format!("http://127.0.0.1:{node_port}/v1/configs")]
        );
    }

    #[tokio::test]
    async fn test_both_paths_failing() {
        let node = Node::new(4, "127.0.0.1", closed_port(), TOKEN);
        let config = EngineConfig::skeleton("warning", 3411);
        let proxy = format!("http://127.0.0.1:{}", closed_port());
        assert_eq!(sync().push(&node, &config, Some(&proxy)).await, PushOutcome::Failed);
    }

    #[tokio::test]
    async fn test_fetch_stats() {
        let port = fake_node().await;
        let node = Node::new(1, "127.0.0.1", port, TOKEN);
        let counters = sync().fetch_stats(&node, None).await.unwrap();
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0].key().unwrap().user_id(), Some(1));

        let bad = Node::new(1, "127.0.0.1", port, "wrong");
        let err = sync().fetch_stats(&bad, None).await.unwrap_err();
        assert!(matches!(err, NodeSyncError::Status { status, .. } if status == StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_fetch_stats_through_proxy() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let proxy = format!("http://127.0.0.1:{}", fake_proxy(seen.clone()).await);
        let node_port = closed_port();
        let node = Node::new(2, "127.0.0.1", node_port, TOKEN);

        let counters = sync().fetch_stats(&node, Some(&proxy)).await.unwrap();
        assert_eq!(counters, vec![Counter::new("user>>>2>>>traffic>>>downlink", 30)]);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [format!("http://127.0.0.1:{node_port}/v1/stats")]
        );

        let err = sync().fetch_stats(&node, None).await.unwrap_err();
        assert!(matches!(err, NodeSyncError::Network(_)));
    }
}
