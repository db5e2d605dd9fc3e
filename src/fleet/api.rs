use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fleet_common::paginate;
use serde::Deserialize;
use tracing::{info, warn};

use super::hub::{FleetHub, HubSettings};
use super::models::NewTemplate;
use super::plugins::PluginHandle;
use super::scheduler::ExecutionPlanScheduler;
use super::store::FleetStore;
use crate::errors::{RealtimeError, SchedulerError, TemplateExists};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn FleetStore>,
    pub scheduler: Arc<ExecutionPlanScheduler>,
    pub devices: PluginHandle,
    pub clients: PluginHandle,
    pub client_token: Option<String>,
    pub page_size: i64,
}

impl AppState {
    pub fn from_hub(hub: &FleetHub, settings: &HubSettings) -> Self {
        Self {
            store: hub.store.clone(),
            scheduler: hub.scheduler.clone(),
            devices: hub.devices.clone(),
            clients: hub.clients.clone(),
            client_token: settings.client_token.clone(),
            page_size: settings.page_size,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub target_device_ids: Option<Vec<String>>,
}

/// Raw pagination parameters; parsed by hand so bad values become 400s.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page: Option<String>,
    pub page_size: Option<String>,
}

impl PageQuery {
    /// `(page, page_size)`: page defaults to 0, page size to `default_size`.
    pub fn resolve(&self, default_size: i64) -> Result<(i64, i64), ApiError> {
        let page = match self.page.as_deref() {
            Some(raw) => parse_page_param("page", raw)?,
            None => 0,
        };
        let page_size = match self.page_size.as_deref() {
            Some(raw) => parse_page_param("pageSize", raw)?,
            None => default_size,
        };
        Ok((page, page_size))
    }
}

fn parse_page_param(name: &str, raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid {}: '{}'", name, raw)))
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let msg = err.to_string();
        match err {
            SchedulerError::InvalidRequest(_) => ApiError::BadRequest(msg),
            SchedulerError::TemplateNotFound { .. } => ApiError::NotFound(msg),
            SchedulerError::Realtime(RealtimeError::PluginStopped { .. }) => {
                ApiError::Unavailable(msg)
            }
            SchedulerError::Storage(_)
            | SchedulerError::PartialStorageFailure { .. }
            | SchedulerError::Realtime(_) => ApiError::Internal(msg),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// `/health` is open; everything under `/api` needs the operator token.
pub fn api_router(state: SharedState) -> Router<SharedState> {
    let protected = Router::new()
        .route("/api/v1/update-template", post(create_template))
        .route("/api/v1/update-template/{id}", get(get_template))
        .route("/api/v1/update-template/{id}/run", post(run_template))
        .route("/api/v1/update-template/{id}/plans", get(list_plans))
        .route("/api/v1/devices", get(list_devices))
        .route_layer(middleware::from_fn_with_state(state, require_bearer));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
}

async fn require_bearer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.client_token.as_deref() else {
        return Err(ApiError::Unauthorized(
            "No client token configured".to_string(),
        ));
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if provided == Some(expected) {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::Unauthorized(
            "Missing or invalid bearer token".to_string(),
        ))
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_template(
    State(state): State<SharedState>,
    Json(new): Json<NewTemplate>,
) -> Result<impl IntoResponse, ApiError> {
    if new.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Template name must not be empty".into()));
    }
    let template = state.store.create_template(new).await.map_err(|e| {
        match e.downcast_ref::<TemplateExists>() {
            Some(exists) => ApiError::Conflict(exists.to_string()),
            None => ApiError::Internal(e.to_string()),
        }
    })?;
    info!(template_id = %template.id, targets = template.target_device_ids.len(), "update template created");
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let template = state
        .store
        .get_template(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Update template {} not found", id)))?;
    Ok(Json(template))
}

/// Body is optional; `targetDeviceIds`, when present, replaces the stored list.
async fn run_template(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid run request: {}", e)))?
    };

    let report = state
        .scheduler
        .run_template(&id, request.target_device_ids)
        .await
        .map_err(|e| {
            warn!(template_id = %id, "template run failed: {}", e);
            ApiError::from(e)
        })?;
    Ok((StatusCode::OK, Json(report)))
}

async fn list_plans(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let plans = state.scheduler.get_plans(&id).await?;
    Ok(Json(plans))
}

async fn list_devices(
    State(state): State<SharedState>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (page, page_size) = query.resolve(state.page_size)?;
    let devices = state
        .store
        .device_summaries()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(paginate(&devices, page, page_size)))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::db::{DbHandle, FleetDb};
    use crate::fleet::models::DeviceRecord;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const TOKEN: &str = "operator";

    struct TestApp {
        router: Router,
        db: DbHandle,
    }

    fn test_app() -> TestApp {
        let db = DbHandle::new(FleetDb::new_in_memory().unwrap());
        let settings = HubSettings {
            device_token: Some("dev".to_string()),
            client_token: Some(TOKEN.to_string()),
            page_size: 2,
        };
        let hub = FleetHub::start(Arc::new(db.clone()), settings.clone());
        let state = Arc::new(AppState::from_hub(&hub, &settings));
        TestApp {
            router: api_router(state.clone()).with_state(state),
            db,
        }
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_t1(app: &TestApp) {
        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/update-template",
                Some(json!({
                    "id": "t1",
                    "name": "edge agent 2.1",
                    "targetDeviceIds": ["d1"],
                    "instruction": {"containerStacks": []}
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_health_check_is_open() {
        let app = test_app();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_api_requires_bearer_token() {
        let app = test_app();
        let request = Request::builder()
            .uri("/api/v1/devices")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/v1/devices")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_create_and_get_template() {
        let app = test_app();
        create_t1(&app).await;

        let response = app
            .router
            .clone()
            .oneshot(request("GET", "/api/v1/update-template/t1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["name"], "edge agent 2.1");
        assert_eq!(body["targetDeviceIds"], json!(["d1"]));
    }

    #[tokio::test]
    async fn test_create_duplicate_template_conflicts() {
        let app = test_app();
        create_t1(&app).await;
        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/update-template",
                Some(json!({"id": "t1", "name": "again"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_concurrent_creates_with_same_id_conflict_once() {
        let app = test_app();
        let create = |name: &str| {
            app.router.clone().oneshot(request(
                "POST",
                "/api/v1/update-template",
                Some(json!({"id": "t9", "name": name})),
            ))
        };
        let (first, second) = tokio::join!(create("a"), create("b"));
        let mut statuses = [first.unwrap().status(), second.unwrap().status()];
        statuses.sort();
        assert_eq!(statuses, [StatusCode::CREATED, StatusCode::CONFLICT]);
    }

    #[tokio::test]
    async fn test_get_missing_template() {
        let app = test_app();
        let response = app
            .router
            .oneshot(request("GET", "/api/v1/update-template/none", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_with_empty_targets_is_bad_request() {
        let app = test_app();
        create_t1(&app).await;
        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/update-template/t1/run",
                Some(json!({"targetDeviceIds": []})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(app.db.list_plans("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_without_body_uses_stored_targets() {
        let app = test_app();
        create_t1(&app).await;
        let response = app
            .router
            .clone()
            .oneshot(request("POST", "/api/v1/update-template/t1/run", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: Value = body_json(response.into_body()).await;
        assert_eq!(report["unreachable"], json!(["d1"]));

        let response = app
            .router
            .oneshot(request("GET", "/api/v1/update-template/t1/plans", None))
            .await
            .unwrap();
        let plans: Value = body_json(response.into_body()).await;
        assert_eq!(plans.as_array().unwrap().len(), 1);
        assert_eq!(plans[0]["isDone"], false);
    }

    #[tokio::test]
    async fn test_run_unknown_template_is_not_found() {
        let app = test_app();
        let response = app
            .router
            .oneshot(request(
                "POST",
                "/api/v1/update-template/ghost/run",
                Some(json!({"targetDeviceIds": ["d1"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_devices_paginates() {
        let app = test_app();
        for id in ["c", "a", "b"] {
            app.db
                .upsert_device(DeviceRecord {
                    device_id: id.to_string(),
                    last_seen: "2026-01-01T00:00:00Z".to_string(),
                    data: json!({}),
                })
                .await
                .unwrap();
        }

        let response = app
            .router
            .clone()
            .oneshot(request("GET", "/api/v1/devices", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: Value = body_json(response.into_body()).await;
        assert_eq!(page["totalCount"], 3);
        assert_eq!(page["pageSize"], 2);
        assert_eq!(page["items"][0]["deviceId"], "a");

        let response = app
            .router
            .oneshot(request("GET", "/api/v1/devices?page=1&pageSize=2", None))
            .await
            .unwrap();
        let page: Value = body_json(response.into_body()).await;
        assert_eq!(page["items"].as_array().unwrap().len(), 1);
        assert_eq!(page["items"][0]["deviceId"], "c");
    }

    #[tokio::test]
    async fn test_list_devices_rejects_unparsable_page() {
        let app = test_app();
        let response = app
            .router
            .oneshot(request("GET", "/api/v1/devices?page=abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_page_query_defaults() {
        let query = PageQuery::default();
        assert_eq!(query.resolve(20).unwrap(), (0, 20));
    }

    #[test]
    fn test_scheduler_error_status_mapping() {
        let cases = [
            (SchedulerError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                SchedulerError::TemplateNotFound { id: "t".into() },
                StatusCode::NOT_FOUND,
            ),
            (
                SchedulerError::Realtime(RealtimeError::PluginStopped { name: "devices" }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SchedulerError::Storage(anyhow::anyhow!("locked")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
