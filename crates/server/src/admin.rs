//! Operator mutations, gated by the `x-admin-token` header.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sluice_core::gateway::Gateway;
use sluice_core::health::{HealthSupervisor, RestartRecord};
use tracing::info;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct AdminState {
    pub admin_token: Option<SecretString>,
    pub supervisor: Arc<HealthSupervisor>,
    pub gateway: Option<Gateway>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdminError {
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClearedResponse {
    pub action: &'static str,
    pub affected: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RestartQuery {
    pub reason: Option<String>,
}

type AdminResult<T> = Result<T, (StatusCode, Json<AdminError>)>;

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/_sluice/admin/cache/clear", post(clear_cache))
        .route("/_sluice/admin/batches/flush", post(flush_batches))
        .route("/_sluice/admin/dedup/clear", post(clear_deduplication))
        .route("/_sluice/admin/restart", post(force_restart))
        .route("/_sluice/admin/restart/reset", post(reset_restart_budget))
        .with_state(state)
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter().zip(right).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

fn admin_guard(headers: &HeaderMap, state: &AdminState) -> AdminResult<()> {
    let Some(expected) = &state.admin_token else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(AdminError { error: "admin endpoints are disabled".to_string() }),
        ));
    };

    match headers.get(ADMIN_TOKEN_HEADER).and_then(|value| value.to_str().ok()) {
        Some(provided)
            if constant_time_eq(provided.as_bytes(), expected.expose_secret().as_bytes()) =>
        {
            Ok(())
        }
        Some(_) => Err((
            StatusCode::UNAUTHORIZED,
            Json(AdminError { error: "invalid admin token".to_string() }),
        )),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(AdminError { error: "missing admin token".to_string() }),
        )),
    }
}

fn gateway(state: &AdminState) -> AdminResult<&Gateway> {
    state.gateway.as_ref().ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(AdminError { error: "this process does not serve traffic".to_string() }),
        )
    })
}

async fn clear_cache(
    headers: HeaderMap,
    State(state): State<AdminState>,
) -> AdminResult<Json<ClearedResponse>> {
    admin_guard(&headers, &state)?;
    let affected = gateway(&state)?.cache().clear();
    info!(event_name = "admin.cache.cleared", affected, "cache cleared by operator");
    Ok(Json(ClearedResponse { action: "cache_clear", affected }))
}

async fn flush_batches(
    headers: HeaderMap,
    State(state): State<AdminState>,
) -> AdminResult<Json<ClearedResponse>> {
    admin_guard(&headers, &state)?;
    let affected = gateway(&state)?.dedup().flush();
    info!(event_name = "admin.batches.flushed", affected, "batch windows flushed by operator");
    Ok(Json(ClearedResponse { action: "batches_flush", affected }))
}

async fn clear_deduplication(
    headers: HeaderMap,
    State(state): State<AdminState>,
) -> AdminResult<Json<ClearedResponse>> {
    admin_guard(&headers, &state)?;
    let affected = gateway(&state)?.dedup().clear();
    info!(event_name = "admin.dedup.cleared", affected, "deduplication table cleared by operator");
    Ok(Json(ClearedResponse { action: "dedup_clear", affected }))
}

async fn force_restart(
    headers: HeaderMap,
    State(state): State<AdminState>,
    Query(query): Query<RestartQuery>,
) -> AdminResult<(StatusCode, Json<RestartRecord>)> {
    admin_guard(&headers, &state)?;
    let reason = query.reason.unwrap_or_else(|| "operator request".to_string());

    match state.supervisor.spawn_force_restart(reason) {
        Ok(record) => Ok((StatusCode::ACCEPTED, Json(record))),
        Err(suppressed) => {
            Err((StatusCode::CONFLICT, Json(AdminError { error: suppressed.to_string() })))
        }
    }
}

async fn reset_restart_budget(
    headers: HeaderMap,
    State(state): State<AdminState>,
) -> AdminResult<Json<ClearedResponse>> {
    admin_guard(&headers, &state)?;
    let affected = state.supervisor.reset_restart_count() as usize;
    info!(event_name = "admin.restart.budget_reset", affected, "restart budget reset by operator");
    Ok(Json(ClearedResponse { action: "restart_reset", affected }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use secrecy::SecretString;
    use sluice_core::config::{AppConfig, HealthConfig};
    use sluice_core::gateway::{Gateway, OriginResponse};
    use sluice_core::health::HealthSupervisor;
    use tower::ServiceExt;

    use crate::admin::{constant_time_eq, router, AdminState};
    use crate::testing::{NoopRestart, StaticSampler};

    fn app(admin_token: Option<&str>, health: HealthConfig) -> (Router, Gateway) {
        let (router, gateway, _) = app_with_supervisor(admin_token, health);
        (router, gateway)
    }

    fn app_with_supervisor(
        admin_token: Option<&str>,
        health: HealthConfig,
    ) -> (Router, Gateway, Arc<HealthSupervisor>) {
        let config = AppConfig::default();
        let gateway = Gateway::new(&config);
        let sampler = Box::new(StaticSampler { rss_bytes: 1 });
        let supervisor =
            Arc::new(HealthSupervisor::new(&health, sampler, Arc::new(NoopRestart)));
        let router = router(AdminState {
            admin_token: admin_token.map(|token| SecretString::from(token.to_string())),
            supervisor: supervisor.clone(),
            gateway: Some(gateway.clone()),
        });
        (router, gateway, supervisor)
    }

    fn post(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn admin_routes_are_hidden_without_a_configured_token() {
        let (router, _) = app(None, AppConfig::default().health);

        let request = post("/_sluice/admin/cache/clear", Some("anything"));
        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_and_cache_is_untouched() {
        let (router, gateway) = app(Some("s3cret"), AppConfig::default().health);
        gateway.cache().set("GET /api/a#1", OriginResponse::new(200, "a"), None).expect("insert");

        let request = post("/_sluice/admin/cache/clear", Some("guess"));
        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(gateway.cache().keys().len(), 1);
    }

    #[tokio::test]
    async fn cache_clear_with_valid_token_empties_the_cache() {
        let (router, gateway) = app(Some("s3cret"), AppConfig::default().health);
        gateway.cache().set("GET /api/a#1", OriginResponse::new(200, "a"), None).expect("insert");

        let request = post("/_sluice/admin/cache/clear", Some("s3cret"));
        let response = router.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(gateway.cache().keys().is_empty());
    }

    #[tokio::test]
    async fn restart_is_refused_once_the_budget_is_spent() {
        let health = HealthConfig { max_restarts: 0, ..AppConfig::default().health };
        let (router, _) = app(Some("s3cret"), health);

        let response = router
            .oneshot(post("/_sluice/admin/restart?reason=deploy", Some("s3cret")))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn restart_is_accepted_within_budget() {
        let (router, _) = app(Some("s3cret"), AppConfig::default().health);

        let response = router
            .oneshot(post("/_sluice/admin/restart?reason=deploy", Some("s3cret")))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn reset_route_reenables_restarts_after_the_budget_is_spent() {
        let health =
            HealthConfig { max_restarts: 1, restart_cooldown_ms: 0, ..AppConfig::default().health };
        let (router, _, supervisor) = app_with_supervisor(Some("s3cret"), health);
        supervisor.force_restart("deploy").await.expect("first restart");

        let refused = router
            .clone()
            .oneshot(post("/_sluice/admin/restart", Some("s3cret")))
            .await
            .expect("response");
        assert_eq!(refused.status(), StatusCode::CONFLICT);

        let unauthorized = router
            .clone()
            .oneshot(post("/_sluice/admin/restart/reset", Some("guess")))
            .await
            .expect("response");
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert!(!supervisor.stats().auto_restart_enabled);

        let reset = router
            .clone()
            .oneshot(post("/_sluice/admin/restart/reset", Some("s3cret")))
            .await
            .expect("response");
        assert_eq!(reset.status(), StatusCode::OK);
        let bytes = to_bytes(reset.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(payload["action"], "restart_reset");
        assert_eq!(payload["affected"], 1);
        assert!(supervisor.stats().auto_restart_enabled);

        let accepted = router
            .oneshot(post("/_sluice/admin/restart", Some("s3cret")))
            .await
            .expect("response");
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn token_comparison_checks_every_byte_and_the_length() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cre"));
        assert!(!constant_time_eq(b"", b"s3cret"));
        assert!(constant_time_eq(b"", b""));
    }
}
