//! Supervisor front door: relays `/api/*` to whichever workers are currently serving.
//!
//! Backends are tried round-robin. A backend that refuses the connection is skipped for
//! that request, so a worker that is mid-restart costs a retry rather than an error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::any,
    Router,
};
use reqwest::Client;
use sluice_core::health::WorkerPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::proxy::ProxyError;
use crate::worker::worker_port;

const CORRELATION_HEADER: &str = "x-correlation-id";
const RETRY_AFTER_SECS: u32 = 1;

pub trait Backends: Send + Sync {
    /// Base URLs of the backends taking traffic right now.
    fn live(&self) -> Vec<String>;
}

/// Worker pool slots, addressed by the port each slot listens on.
pub struct PoolBackends {
    pool: Arc<WorkerPool>,
    host: String,
    base_port: u16,
}

impl PoolBackends {
    pub fn new(pool: Arc<WorkerPool>, bind_address: &str, base_port: u16) -> Self {
        Self { pool, host: connect_host(bind_address), base_port }
    }
}

impl Backends for PoolBackends {
    fn live(&self) -> Vec<String> {
        self.pool
            .serving_slots()
            .into_iter()
            .map(|slot| backend_url(&self.host, self.base_port, slot))
            .collect()
    }
}

fn backend_url(host: &str, base_port: u16, slot: usize) -> String {
    format!("http://{host}:{}", worker_port(base_port, slot))
}

/// Workers bound to a wildcard address are reached over loopback.
fn connect_host(bind_address: &str) -> String {
    match bind_address {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        other if other.contains(':') && !other.starts_with('[') => format!("[{other}]"),
        other => other.to_string(),
    }
}

#[derive(Clone)]
pub struct ForwardState {
    backends: Arc<dyn Backends>,
    client: Client,
    next: Arc<AtomicUsize>,
}

impl ForwardState {
    pub fn new(backends: Arc<dyn Backends>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { backends, client, next: Arc::new(AtomicUsize::new(0)) })
    }
}

pub fn router(state: ForwardState) -> Router {
    Router::new().route("/api/{*path}", any(forward)).with_state(state)
}

async fn forward(
    State(state): State<ForwardState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let outgoing = request_headers(&headers, &correlation_id);
    let path_and_query = uri.path_and_query().map(|value| value.as_str()).unwrap_or("/");

    let backends = state.backends.live();
    if backends.is_empty() {
        return unavailable("no worker is serving", &correlation_id);
    }

    let start = state.next.fetch_add(1, Ordering::Relaxed);
    for offset in 0..backends.len() {
        let backend = &backends[(start + offset) % backends.len()];
        let url = format!("{backend}{path_and_query}");
        let attempt = state
            .client
            .request(method.clone(), &url)
            .headers(outgoing.clone())
            .body(body.clone())
            .send()
            .await;

        match attempt {
            Ok(response) => {
                debug!(
                    event_name = "forward.relayed",
                    correlation_id = %correlation_id,
                    backend = %backend,
                    status = response.status().as_u16(),
                    "worker answered"
                );
                return relay(response, &correlation_id).await;
            }
            Err(error) if error.is_connect() => {
                warn!(
                    event_name = "forward.backend.refused",
                    correlation_id = %correlation_id,
                    backend = %backend,
                    error = %error,
                    "worker refused the connection; trying the next one"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "forward.backend.failed",
                    correlation_id = %correlation_id,
                    backend = %backend,
                    error = %error,
                    "worker call failed"
                );
                let status = if error.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                return failure(status, format!("worker call failed: {error}"), &correlation_id);
            }
        }
    }

    unavailable("no worker accepted the connection", &correlation_id)
}

/// Connection-scoped headers stay with the hop they arrived on.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn request_headers(headers: &HeaderMap, correlation_id: &str) -> HeaderMap {
    let mut outgoing = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        outgoing.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        outgoing.insert(CORRELATION_HEADER, value);
    }
    outgoing
}

async fn relay(response: reqwest::Response, correlation_id: &str) -> Response {
    let status = response.status();
    let headers = response.headers().clone();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(error) => {
            return failure(
                StatusCode::BAD_GATEWAY,
                format!("worker response was cut short: {error}"),
                correlation_id,
            );
        }
    };

    let mut http = (status, body).into_response();
    let outgoing = http.headers_mut();
    outgoing.remove(header::CONTENT_TYPE);
    for (name, value) in &headers {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        outgoing.append(name.clone(), value.clone());
    }
    http
}

fn failure(status: StatusCode, error: String, correlation_id: &str) -> Response {
    let payload = ProxyError { error, correlation_id: correlation_id.to_string() };
    let mut http = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        http.headers_mut().insert(CORRELATION_HEADER, value);
    }
    http
}

fn unavailable(error: &str, correlation_id: &str) -> Response {
    let mut http = failure(StatusCode::SERVICE_UNAVAILABLE, error.to_string(), correlation_id);
    http.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    http
}
