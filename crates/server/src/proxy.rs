use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::any,
    Router,
};
use serde::Serialize;
use sluice_core::admission::Ticket;
use sluice_core::dedup::{RequestBody, RequestDescriptor};
use sluice_core::errors::InterfaceError;
use sluice_core::gateway::{Gateway, GatewayResponse, OriginFetcher};
use uuid::Uuid;

const CORRELATION_HEADER: &str = "x-correlation-id";
const SOURCE_HEADER: &str = "x-sluice-source";
const ANONYMOUS_CLIENT: &str = "anonymous";

#[derive(Clone)]
pub struct ProxyState {
    pub gateway: Gateway,
    pub origin: Arc<dyn OriginFetcher>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProxyError {
    pub error: String,
    pub correlation_id: String,
}

pub fn router(state: ProxyState) -> Router {
    Router::new().route("/api/{*path}", any(proxy)).with_state(state)
}

pub async fn proxy(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = header_value(&headers, CORRELATION_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let client_key = header_value(&headers, "x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .unwrap_or(ANONYMOUS_CLIENT);

    let mut request = RequestDescriptor::new(method.as_str(), uri.path());
    for (key, value) in query {
        request = request.with_query(key, value);
    }
    if !body.is_empty() {
        let content_type =
            header_value(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string);
        request = request.with_raw_body(RequestBody::new(content_type, body.to_vec()));
    }

    let ticket = Ticket::new(correlation_id.clone(), client_key).with_size_estimate(body.len());
    match state.gateway.handle(ticket, request, state.origin.clone()).await {
        Ok(response) => success_response(response, &correlation_id),
        Err(error) => {
            error_response(error.into_interface(correlation_id, state.gateway.queue_timeout()))
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).filter(|value| !value.is_empty())
}

fn success_response(response: GatewayResponse, correlation_id: &str) -> Response {
    let status = StatusCode::from_u16(response.response.status).unwrap_or(StatusCode::OK);
    let mut http = (status, response.response.body).into_response();
    let headers = http.headers_mut();

    if let Some(content_type) =
        response.response.content_type.and_then(|value| HeaderValue::from_str(&value).ok())
    {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(response.source.as_str()));
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(CORRELATION_HEADER, value);
    }
    http
}

fn error_response(error: InterfaceError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload = ProxyError {
        error: error.user_message(),
        correlation_id: error.correlation_id().to_string(),
    };
    let mut http = (status, Json(payload)).into_response();

    if let InterfaceError::ServiceUnavailable { retry_after_secs, .. } = &error {
        http.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
    }
    if let Ok(value) = HeaderValue::from_str(error.correlation_id()) {
        http.headers_mut().insert(CORRELATION_HEADER, value);
    }
    http
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use sluice_core::config::AppConfig;
    use sluice_core::dedup::RequestDescriptor;
    use sluice_core::errors::OriginError;
    use sluice_core::gateway::{Gateway, OriginFetcher, OriginResponse};
    use tower::ServiceExt;

    use crate::proxy::{router, ProxyState};

    #[derive(Default)]
    struct EchoOrigin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OriginFetcher for EchoOrigin {
        async fn fetch(&self, request: RequestDescriptor) -> Result<OriginResponse, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.path.ends_with("/missing") {
                return Err(OriginError::with_status(404, "contact not found"));
            }
            let body = serde_json::json!({
                "method": request.method,
                "path": request.path,
                "query": request.query,
                "content_type": request.body.as_ref().and_then(|body| body.content_type.clone()),
                "body": request.body.as_ref().and_then(|body| body.as_json()),
                "raw": request
                    .body
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(&body.bytes).into_owned()),
            });
            Ok(OriginResponse::json(200, body.to_string()))
        }
    }

    fn app(configure: impl FnOnce(&mut AppConfig)) -> (axum::Router, Arc<EchoOrigin>) {
        let mut config = AppConfig::default();
        configure(&mut config);
        let origin = Arc::new(EchoOrigin::default());
        let router = router(ProxyState { gateway: Gateway::new(&config), origin: origin.clone() });
        (router, origin)
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn repeated_read_is_marked_as_cache_hit() {
        let (router, origin) = app(|_| {});
        let request = || {
            Request::builder()
                .uri("/api/crm/contacts?page=2")
                .header("x-correlation-id", "corr-1")
                .body(Body::empty())
                .expect("request")
        };

        let first = router.clone().oneshot(request()).await.expect("first");
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-sluice-source"], "origin");
        assert_eq!(first.headers()["x-correlation-id"], "corr-1");
        let payload = json_body(first).await;
        assert_eq!(payload["path"], "/api/crm/contacts");
        assert_eq!(payload["query"], serde_json::json!([["page", "2"]]));

        let second = router.oneshot(request()).await.expect("second");
        assert_eq!(second.headers()["x-sluice-source"], "cache");
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn json_bodies_are_forwarded() {
        let (router, _) = app(|_| {});
        let request = Request::builder()
            .method("POST")
            .uri("/api/llm/complete")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"prompt":"hi"}"#))
            .expect("request");

        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(payload["method"], "POST");
        assert_eq!(payload["body"]["prompt"], "hi");
    }

    #[tokio::test]
    async fn form_bodies_reach_the_origin_unchanged() {
        let (router, _) = app(|_| {});
        let request = Request::builder()
            .method("POST")
            .uri("/api/crm/contacts?tag=a&tag=b")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("name=ana&city=porto"))
            .expect("request");

        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(payload["content_type"], "application/x-www-form-urlencoded");
        assert_eq!(payload["raw"], "name=ana&city=porto");
        assert_eq!(payload["body"], Value::Null);
        assert_eq!(payload["query"], serde_json::json!([["tag", "a"], ["tag", "b"]]));
    }

    #[tokio::test]
    async fn origin_status_passes_through() {
        let (router, _) = app(|_| {});
        let request =
            Request::builder().uri("/api/crm/contacts/missing").body(Body::empty()).expect("req");

        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let payload = json_body(response).await;
        assert_eq!(payload["error"], "contact not found");
    }

    #[tokio::test]
    async fn oversized_responses_become_payload_too_large() {
        let (router, _) = app(|config| config.admission.max_response_size_bytes = 8);
        let request = Request::builder().uri("/api/crm/contacts").body(Body::empty()).expect("req");

        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let payload = json_body(response).await;
        assert!(payload["error"].as_str().unwrap_or_default().contains("8 bytes"));
    }

    #[tokio::test]
    async fn draining_gateway_answers_service_unavailable_with_retry_hint() {
        let mut config = AppConfig::default();
        config.admission.queue_timeout_ms = 5_000;
        let gateway = Gateway::new(&config);
        gateway.admission().drain(std::time::Duration::from_millis(1)).await;
        let router = router(ProxyState { gateway, origin: Arc::new(EchoOrigin::default()) });
        let request = Request::builder().uri("/api/crm/contacts").body(Body::empty()).expect("req");

        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "5");
    }
}
