//! HTTP transport
//!
//! Talks to a tool endpoint exposed at a base URL:
//!
//! - `GET {base}/tools` returns `{"tools": [ToolSpec]}`
//! - `POST {base}/call_tool` with `{"method": "tools/call", "params": {name, arguments}}`
//!   returns `{"result": ...}`
//!
//! One pooled `reqwest::Client` is reused for every call, so concurrent
//! requests share connections and need no serialization.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use sdk::types::{CallParams, FailureKind, ToolResult, ToolSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{Result, ToolTransport, TransportError, TransportKind};

/// Body of a call request
#[derive(Debug, Serialize)]
struct CallRequest {
    method: &'static str,
    params: CallParams,
}

/// Discovery answers either `{tools: [...]}` or a bare array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolListBody {
    Wrapped { tools: Vec<ToolSpec> },
    Bare(Vec<ToolSpec>),
}

/// Transport for a remotely hosted tool endpoint
pub struct RemoteTransport {
    id: String,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: Client,
    tools: OnceCell<Vec<ToolSpec>>,
}

impl RemoteTransport {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout,
            client,
            tools: OnceCell::new(),
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if e.is_connect() {
            TransportError::Unavailable(format!(
                "cannot connect to endpoint '{}' at {}",
                self.id, self.base_url
            ))
        } else {
            TransportError::Unavailable(e.to_string())
        }
    }

    fn map_body_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Malformed(e.to_string())
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolSpec>> {
        let url = format!("{}/tools", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ToolListBody = response.json().await.map_err(|e| self.map_body_error(e))?;
        Ok(match body {
            ToolListBody::Wrapped { tools } => tools,
            ToolListBody::Bare(tools) => tools,
        })
    }
}

/// Payload of a call response: `result` when present, else the whole body
fn unwrap_result(body: Value) -> ToolResult {
    match body {
        Value::Object(mut map) => {
            if let Some(result) = map.remove("result") {
                return ToolResult::ok(result);
            }
            if let Some(error) = map.get("error") {
                let message = error
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return ToolResult::failure(FailureKind::ToolFailed, message);
            }
            ToolResult::ok(Value::Object(map))
        }
        other => ToolResult::ok(other),
    }
}

#[async_trait]
impl ToolTransport for RemoteTransport {
    fn endpoint_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    fn supports_concurrent_calls(&self) -> bool {
        true
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let tools = self.tools.get_or_try_init(|| self.fetch_tools()).await?;
        Ok(tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let url = format!("{}/call_tool", self.base_url);
        let body = CallRequest {
            method: "tools/call",
            params: CallParams {
                name: name.to_string(),
                arguments,
            },
        };

        let start = Instant::now();
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        debug!(
            endpoint = %self.id,
            tool = %name,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Remote tool responded"
        );

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(ToolResult::failure(
                FailureKind::ToolFailed,
                format!("HTTP {}: {}", status.as_u16(), text),
            ));
        }

        let body: Value = response.json().await.map_err(|e| self.map_body_error(e))?;
        Ok(unwrap_result(body))
    }

    async fn shutdown(&self) {
        // Pooled connections close when the client is dropped
        debug!(endpoint = %self.id, "Remote endpoint released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_unwrap_result_prefers_result_field() {
        assert_eq!(unwrap_result(json!({"result": 5})).value, json!(5));
        assert_eq!(
            unwrap_result(json!({"rows": [1, 2]})).value,
            json!({"rows": [1, 2]})
        );
        let failed = unwrap_result(json!({"error": "quota"}));
        assert!(!failed.success);
        assert!(failed.text().contains("quota"));
    }

    #[tokio::test]
    async fn test_list_tools_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp/tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tools": [{"name": "search", "description": "web", "inputSchema": {"type": "object"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport =
            RemoteTransport::new("web", format!("{}/mcp/", server.uri()), Duration::from_secs(5))
                .unwrap();
        let first = transport.list_tools().await.unwrap();
        let second = transport.list_tools().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].name, "search");
    }

    #[tokio::test]
    async fn test_call_tool_sends_envelope_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call_tool"))
            .and(header("authorization", "Bearer k3y"))
            .and(body_partial_json(json!({
                "method": "tools/call",
                "params": {"name": "search", "arguments": {"query": "f1"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": ["a", "b"]})))
            .mount(&server)
            .await;

        let transport = RemoteTransport::new("web", server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_api_key("k3y");
        let result = transport
            .call_tool("search", json!({"query": "f1"}))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.value, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_http_error_status_is_failed_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call_tool"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let transport = RemoteTransport::new("web", server.uri(), Duration::from_secs(5)).unwrap();
        let result = transport.call_tool("search", json!({})).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::ToolFailed));
        assert!(result.text().contains("500"));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/call_tool"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": 1}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let transport =
            RemoteTransport::new("web", server.uri(), Duration::from_millis(200)).unwrap();
        let err = transport.call_tool("x", json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        // Port 9 (discard) is almost never listening
        let transport =
            RemoteTransport::new("dead", "http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = transport.list_tools().await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)), "{:?}", err);
    }
}
