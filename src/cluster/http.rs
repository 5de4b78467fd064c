use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment as KubeDeployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::client::{ClusterClient, ClusterError, ClusterEvent, EventStream};

/// Talks to the Kubernetes REST API directly, typically through
/// `kubectl proxy` or with a bearer token.
#[derive(Clone)]
pub struct HttpClusterClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct WatchFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

impl HttpClusterClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(request: RequestBuilder) -> Result<Response, ClusterError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClusterError::Status {
            code: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ClusterError> {
        let body = Self::send(request).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KubeDeployment, ClusterError> {
        let path = format!("/apis/apps/v1/namespaces/{}/deployments/{}", namespace, name);
        match Self::fetch(self.get(&path)).await {
            Err(ClusterError::Status { code: 404, .. }) => Err(ClusterError::NotFound {
                kind: "deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            other => other,
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let path = format!("/api/v1/namespaces/{}/pods", namespace);
        let list: ItemList<Pod> =
            Self::fetch(self.get(&path).query(&[("labelSelector", selector)])).await?;
        Ok(list.items)
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ReplicaSet>, ClusterError> {
        let path = format!("/apis/apps/v1/namespaces/{}/replicasets", namespace);
        let list: ItemList<ReplicaSet> =
            Self::fetch(self.get(&path).query(&[("labelSelector", selector)])).await?;
        Ok(list.items)
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, ClusterError> {
        let path = format!("/api/v1/namespaces/{}/endpoints/{}", namespace, name);
        match Self::fetch(self.get(&path)).await {
            Ok(endpoints) => Ok(Some(endpoints)),
            Err(ClusterError::Status { code, .. }) if code == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn watch_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<EventStream, ClusterError> {
        let path = format!("/apis/apps/v1/namespaces/{}/deployments", namespace);
        let field_selector = format!("metadata.name={}", name);
        let request = self
            .get(&path)
            .query(&[("watch", "true"), ("fieldSelector", field_selector.as_str())]);
        let response = Self::send(request).await?;
        debug!("Opened watch on deployment {}/{}", namespace, name);

        let mut body = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = BytesMut::with_capacity(8192);
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => buffer.extend_from_slice(&chunk),
                    Err(e) => {
                        yield Err(ClusterError::Http(e));
                        break;
                    }
                }
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(pos + 1);
                    if let Some(event) = parse_watch_line(&line[..pos]) {
                        yield event;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Decodes one newline-delimited watch frame. Blank lines and bookmarks
/// yield nothing.
pub(crate) fn parse_watch_line(line: &[u8]) -> Option<Result<ClusterEvent, ClusterError>> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    let frame: WatchFrame = match serde_json::from_slice(line) {
        Ok(frame) => frame,
        Err(e) => return Some(Err(e.into())),
    };

    let decode = |object: Value| -> Result<Box<KubeDeployment>, ClusterError> {
        Ok(Box::new(serde_json::from_value(object)?))
    };

    match frame.kind.as_str() {
        "ADDED" | "MODIFIED" => Some(decode(frame.object).map(ClusterEvent::Applied)),
        "DELETED" => Some(decode(frame.object).map(ClusterEvent::Deleted)),
        "ERROR" => {
            let message = frame
                .object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown watch error")
                .to_string();
            Some(Ok(ClusterEvent::Error(message)))
        }
        "BOOKMARK" => None,
        other => Some(Err(ClusterError::Watch(format!(
            "unexpected watch event type {}",
            other
        )))),
    }
}
