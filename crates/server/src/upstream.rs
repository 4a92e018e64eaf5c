//! reqwest-backed origin: forwards proxied requests to the configured upstream base URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use sluice_core::config::UpstreamConfig;
use sluice_core::dedup::RequestDescriptor;
use sluice_core::errors::OriginError;
use sluice_core::gateway::{OriginFetcher, OriginResponse};
use tracing::debug;

const PROXY_PREFIX: &str = "/api";

#[derive(Clone)]
pub struct HttpOrigin {
    client: Client,
    base_url: String,
    batch_path: Option<String>,
}

#[derive(Serialize)]
struct BatchEnvelope<'a> {
    requests: Vec<BatchItem<'a>>,
}

/// One member of a batch call. JSON bodies travel as JSON, anything else as text.
#[derive(Serialize)]
struct BatchItem<'a> {
    method: &'a str,
    path: &'a str,
    query: &'a [(String, String)],
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

impl<'a> From<&'a RequestDescriptor> for BatchItem<'a> {
    fn from(request: &'a RequestDescriptor) -> Self {
        let body = request.body.as_ref().map(|body| {
            body.as_json()
                .unwrap_or_else(|| Value::String(String::from_utf8_lossy(&body.bytes).into_owned()))
        });
        Self {
            method: &request.method,
            path: &request.path,
            query: &request.query,
            content_type: request.body.as_ref().and_then(|body| body.content_type.as_deref()),
            body,
        }
    }
}

impl HttpOrigin {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            batch_path: config.batch_path.clone(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        let forwarded = path.strip_prefix(PROXY_PREFIX).unwrap_or(path);
        if forwarded.starts_with('/') {
            format!("{}{forwarded}", self.base_url)
        } else {
            format!("{}/{forwarded}", self.base_url)
        }
    }
}

fn transport_error(error: reqwest::Error) -> OriginError {
    if error.is_timeout() {
        OriginError::with_status(504, format!("upstream timed out: {error}"))
    } else {
        OriginError::with_status(502, format!("upstream unreachable: {error}"))
    }
}

#[async_trait]
impl OriginFetcher for HttpOrigin {
    async fn fetch(&self, request: RequestDescriptor) -> Result<OriginResponse, OriginError> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            OriginError::with_status(405, format!("unsupported method `{}`", request.method))
        })?;
        let url = self.url_for(&request.path);

        let mut builder = self.client.request(method, &url).query(&request.query);
        if let Some(body) = request.body {
            if let Some(content_type) = &body.content_type {
                builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
            }
            builder = builder.body(body.bytes);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(transport_error)?;
        debug!(
            event_name = "upstream.response",
            url = %url,
            status = status.as_u16(),
            "upstream answered"
        );

        if !status.is_success() {
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("upstream error").to_string()
            } else {
                body
            };
            return Err(OriginError::with_status(status.as_u16(), message));
        }

        Ok(OriginResponse { status: status.as_u16(), content_type, body })
    }

    fn supports_batch(&self) -> bool {
        self.batch_path.is_some()
    }

    async fn fetch_batch(
        &self,
        requests: Vec<RequestDescriptor>,
    ) -> Result<Vec<OriginResponse>, OriginError> {
        let Some(batch_path) = &self.batch_path else {
            return Err(OriginError::new("upstream has no batch endpoint configured"));
        };
        let url = self.url_for(batch_path);

        let response = self
            .client
            .post(&url)
            .json(&BatchEnvelope { requests: requests.iter().map(BatchItem::from).collect() })
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OriginError::with_status(status.as_u16(), message));
        }

        response
            .json::<Vec<OriginResponse>>()
            .await
            .map_err(|error| OriginError::with_status(502, format!("bad batch payload: {error}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{
        body::Bytes,
        extract::{Query, RawQuery},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use sluice_core::config::UpstreamConfig;
    use sluice_core::dedup::{RequestBody, RequestDescriptor};
    use sluice_core::gateway::{OriginFetcher, OriginResponse};

    use super::HttpOrigin;

    async fn upstream() -> String {
        let router = Router::new()
            .route(
                "/crm/contacts",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    Json(json!({ "page": query.get("page").cloned().unwrap_or_default() }))
                }),
            )
            .route(
                "/crm/query",
                get(|RawQuery(query): RawQuery| async move { query.unwrap_or_default() }),
            )
            .route("/crm/broken", get(|| async { (StatusCode::BAD_GATEWAY, "crm down") }))
            .route(
                "/crm/echo",
                post(|headers: HeaderMap, body: Bytes| async move {
                    let content_type = headers
                        .get("content-type")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    format!("{content_type}|{}", String::from_utf8_lossy(&body))
                }),
            )
            .route(
                "/batch",
                post(|Json(payload): Json<Value>| async move {
                    let items = payload["requests"].as_array().cloned().unwrap_or_default();
                    Json(
                        items
                            .iter()
                            .map(|item| {
                                let body = match &item["body"] {
                                    Value::Null => item["path"].to_string(),
                                    body => body.to_string(),
                                };
                                OriginResponse::new(200, body)
                            })
                            .collect::<Vec<_>>(),
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{address}")
    }

    fn origin(base_url: String) -> HttpOrigin {
        HttpOrigin::new(&UpstreamConfig {
            base_url,
            timeout_secs: 5,
            batch_path: Some("/batch".to_string()),
        })
        .expect("client builds")
    }

    #[tokio::test]
    async fn forwards_path_without_proxy_prefix_and_keeps_query() {
        let origin = origin(upstream().await);

        let response = origin
            .fetch(RequestDescriptor::new("GET", "/api/crm/contacts").with_query("page", "3"))
            .await
            .expect("upstream answers");

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(response.body, r#"{"page":"3"}"#);
    }

    #[tokio::test]
    async fn repeated_query_keys_reach_the_upstream() {
        let origin = origin(upstream().await);

        let response = origin
            .fetch(
                RequestDescriptor::new("GET", "/api/crm/query")
                    .with_query("page", "4")
                    .with_query("page", "5"),
            )
            .await
            .expect("upstream answers");

        assert_eq!(response.body, "page=4&page=5");
    }

    #[tokio::test]
    async fn non_json_bodies_are_forwarded_byte_for_byte() {
        let origin = origin(upstream().await);
        let form = RequestBody::new(
            Some("application/x-www-form-urlencoded".to_string()),
            "name=ana&note=%22quoted%22",
        );

        let response = origin
            .fetch(RequestDescriptor::new("POST", "/api/crm/echo").with_raw_body(form))
            .await
            .expect("upstream answers");

        assert_eq!(
            response.body,
            "application/x-www-form-urlencoded|name=ana&note=%22quoted%22"
        );
    }

    #[tokio::test]
    async fn upstream_failures_keep_status_and_message() {
        let origin = origin(upstream().await);

        let error = origin
            .fetch(RequestDescriptor::new("GET", "/api/crm/broken"))
            .await
            .expect_err("upstream failure propagates");

        assert_eq!(error.status, Some(502));
        assert_eq!(error.message, "crm down");
    }

    #[tokio::test]
    async fn batch_call_returns_one_response_per_request() {
        let origin = origin(upstream().await);
        assert!(origin.supports_batch());

        let responses = origin
            .fetch_batch(vec![
                RequestDescriptor::new("GET", "/api/crm/contacts/1"),
                RequestDescriptor::new("POST", "/api/llm/complete")
                    .with_body(json!({"prompt": "hi"})),
            ])
            .await
            .expect("batch succeeds");

        assert_eq!(
            responses.iter().map(|response| response.body.as_str()).collect::<Vec<_>>(),
            vec![r#""/api/crm/contacts/1""#, r#"{"prompt":"hi"}"#]
        );
    }
}
