use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use sluice_core::cache::PopularKey;
use sluice_core::config::ProcessRole;
use sluice_core::dedup::{ActiveBatch, DuplicateDetail};
use sluice_core::gateway::{Gateway, GatewayStats};
use sluice_core::health::{HealthStats, HealthStatus, HealthSupervisor, WorkerPool, WorkerStatus};

const POPULAR_KEY_LIMIT: usize = 20;

#[derive(Clone)]
pub struct HealthState {
    pub role: ProcessRole,
    pub supervisor: Arc<HealthSupervisor>,
    pub gateway: Option<Gateway>,
    pub pool: Option<Arc<WorkerPool>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub role: ProcessRole,
    pub health: HealthStats,
    pub checked_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsResponse {
    pub role: ProcessRole,
    pub gateway: Option<GatewayStats>,
    pub health: HealthStats,
    pub workers: Option<Vec<WorkerStatus>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
    pub popular: Vec<PopularKey>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/_sluice/health", get(health))
        .route("/_sluice/stats", get(stats))
        .route("/_sluice/batches", get(active_batches))
        .route("/_sluice/duplicates", get(duplicate_details))
        .route("/_sluice/cache/keys", get(cache_keys))
        .with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.supervisor.stats();
    let healthy = health.status == HealthStatus::Healthy;
    let status_code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let payload = HealthResponse {
        status: health.status,
        role: state.role,
        health,
        checked_at: Utc::now().to_rfc3339(),
    };
    (status_code, Json(payload))
}

pub async fn stats(State(state): State<HealthState>) -> Json<StatsResponse> {
    let workers = match &state.pool {
        Some(pool) => Some(pool.status().await),
        None => None,
    };
    Json(StatsResponse {
        role: state.role,
        gateway: state.gateway.as_ref().map(Gateway::stats),
        health: state.supervisor.stats(),
        workers,
    })
}

pub async fn active_batches(State(state): State<HealthState>) -> Json<Vec<ActiveBatch>> {
    Json(state.gateway.map(|gateway| gateway.dedup().active_batches()).unwrap_or_default())
}

pub async fn duplicate_details(State(state): State<HealthState>) -> Json<Vec<DuplicateDetail>> {
    Json(state.gateway.map(|gateway| gateway.dedup().duplicate_details()).unwrap_or_default())
}

pub async fn cache_keys(State(state): State<HealthState>) -> Json<KeysResponse> {
    let Some(gateway) = state.gateway else {
        return Json(KeysResponse { keys: Vec::new(), popular: Vec::new() });
    };
    Json(KeysResponse {
        keys: gateway.cache().keys(),
        popular: gateway.cache().popular(POPULAR_KEY_LIMIT),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::State,
        http::{Request, StatusCode},
        Json,
    };
    use serde_json::Value;
    use sluice_core::config::{AppConfig, ProcessRole};
    use sluice_core::gateway::{Gateway, OriginResponse};
    use sluice_core::health::{HealthStatus, HealthSupervisor};
    use tower::ServiceExt;

    use crate::health::{health, router, HealthState};
    use crate::testing::{NoopRestart, StaticSampler};

    fn state(rss_bytes: u64) -> HealthState {
        let config = AppConfig::default();
        let supervisor = HealthSupervisor::new(
            &config.health,
            Box::new(StaticSampler { rss_bytes }),
            Arc::new(NoopRestart),
        );
        HealthState {
            role: ProcessRole::Single,
            supervisor: Arc::new(supervisor),
            gateway: Some(Gateway::new(&config)),
            pool: None,
        }
    }

    #[tokio::test]
    async fn health_returns_ok_while_below_thresholds() {
        let state = state(1024);
        state.supervisor.sample().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, HealthStatus::Healthy);
        assert_eq!(payload.role, ProcessRole::Single);
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_degraded() {
        let state = state(u64::MAX);
        state.supervisor.sample().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, HealthStatus::Degraded);
        assert_eq!(payload.health.memory_streak, 1);
    }

    #[tokio::test]
    async fn cache_keys_lists_resident_entries() {
        let state = state(1024);
        let gateway = state.gateway.clone().expect("gateway");
        gateway
            .cache()
            .set("GET /api/crm/contacts#abc", OriginResponse::new(200, "[]"), None)
            .expect("insert");

        let response = router(state)
            .oneshot(
                Request::builder().uri("/_sluice/cache/keys").body(Body::empty()).expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["keys"], serde_json::json!(["GET /api/crm/contacts#abc"]));
    }
}
