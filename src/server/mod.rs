//! In-memory implementation of the records API.
//!
//! Serves the same routes the sync client talks to, guarded by a single
//! bearer token, with hooks to inject failures and latency. Used by the
//! `medsync-server` binary for local development and by the integration tests.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::models::EntityType;

/// The four calls the API supports per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    status: StatusCode,
    /// `None` fails forever.
    remaining: Option<u32>,
}

struct Inner {
    token: String,
    records: Mutex<HashMap<EntityType, Vec<Value>>>,
    failures: Mutex<HashMap<(EntityType, Operation), Failure>>,
    calls: Mutex<HashMap<(EntityType, Operation), usize>>,
    healthy: AtomicBool,
    latency: Mutex<Duration>,
}

/// Shared handle to the server state; clones see the same data.
#[derive(Clone)]
pub struct MockApi {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: token.into(),
                records: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                healthy: AtomicBool::new(true),
                latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub fn router(&self) -> Router {
        router(self.clone())
    }

    /// Stores a record as if a client had created it earlier.
    pub fn seed(&self, entity: EntityType, record: Value) {
        lock(&self.inner.records)
            .entry(entity)
            .or_default()
            .push(record);
    }

    pub fn records(&self, entity: EntityType) -> Vec<Value> {
        lock(&self.inner.records)
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find(&self, entity: EntityType, id: &str) -> Option<Value> {
        self.records(entity)
            .into_iter()
            .find(|r| record_id(r).as_deref() == Some(id))
    }

    /// Makes every `operation` on `entity` answer `status`.
    pub fn fail(&self, entity: EntityType, operation: Operation, status: u16) {
        self.insert_failure(entity, operation, status, None);
    }

    /// Makes the next `times` calls of `operation` on `entity` answer `status`.
    /// Zero `times` removes any failure set for the pair.
    pub fn fail_times(&self, entity: EntityType, operation: Operation, status: u16, times: u32) {
        if times == 0 {
            lock(&self.inner.failures).remove(&(entity, operation));
            return;
        }
        self.insert_failure(entity, operation, status, Some(times));
    }

    fn insert_failure(
        &self,
        entity: EntityType,
        operation: Operation,
        status: u16,
        remaining: Option<u32>,
    ) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        lock(&self.inner.failures).insert((entity, operation), Failure { status, remaining });
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.failures).clear();
    }

    /// Number of authenticated calls of `operation` on `entity` so far.
    pub fn calls(&self, entity: EntityType, operation: Operation) -> usize {
        lock(&self.inner.calls)
            .get(&(entity, operation))
            .copied()
            .unwrap_or(0)
    }

    /// Makes `/health` answer 503 while false.
    pub fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::Release);
    }

    /// Delay added before every API response.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Counts the call and returns the injected failure, if one applies.
    async fn begin(&self, entity: EntityType, operation: Operation) -> Option<Response> {
        *lock(&self.inner.calls).entry((entity, operation)).or_default() += 1;

        let latency = *lock(&self.inner.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut failures = lock(&self.inner.failures);
        let failure = failures.get_mut(&(entity, operation))?;
        let status = failure.status;
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                failures.remove(&(entity, operation));
            }
        }
        Some(error_response(status, "Injected failure"))
    }
}

/// Binds `127.0.0.1:0`, serves `api` in the background and returns the address.
pub async fn spawn_local(api: MockApi) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = api.router();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Mock API stopped: {}", e);
        }
    });
    Ok(addr)
}

/// Routes: `GET /health`, then per entity `GET|POST /{entity}` and
/// `PUT|DELETE /{entity}/{id}` behind bearer auth.
pub fn router(api: MockApi) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/{entity}", get(list).post(create))
        .route("/{entity}/{id}", axum::routing::put(update).delete(remove))
        .layer(middleware::from_fn_with_state(api.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(api)
        .layer(TraceLayer::new_for_http())
}

/// Error response body
#[derive(Serialize)]
struct ApiError<'a> {
    error: &'a str,
    message: &'a str,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ApiError {
            error: status.canonical_reason().unwrap_or("error"),
            message,
        }),
    )
        .into_response()
}

/// Authentication middleware
async fn auth_middleware(State(api): State<MockApi>, request: Request, next: Next) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "Authorization header must use Bearer scheme",
            );
        }
        None => {
            return error_response(StatusCode::UNAUTHORIZED, "Authorization header required");
        }
    };

    if token != api.inner.token {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid token");
    }
    next.run(request).await
}

async fn health(State(api): State<MockApi>) -> Response {
    if api.inner.healthy.load(Ordering::Acquire) {
        Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")})).into_response()
    } else {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "Maintenance")
    }
}

fn resolve(path: &str) -> Result<EntityType, Response> {
    EntityType::ALL
        .into_iter()
        .find(|e| e.api_path() == path)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Unknown collection"))
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn list(
    State(api): State<MockApi>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let entity = match resolve(&path) {
        Ok(entity) => entity,
        Err(response) => return response,
    };
    if let Some(failure) = api.begin(entity, Operation::List).await {
        return failure;
    }

    let scope = query.get("patientProfileId");
    let items: Vec<Value> = api
        .records(entity)
        .into_iter()
        .filter(|r| match scope {
            Some(scope) => r.get("patientProfileId").and_then(Value::as_str) == Some(scope),
            None => true,
        })
        .collect();
    Json(json!({ "items": items })).into_response()
}

async fn create(
    State(api): State<MockApi>,
    Path(path): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    let entity = match resolve(&path) {
        Ok(entity) => entity,
        Err(response) => return response,
    };
    if let Some(failure) = api.begin(entity, Operation::Create).await {
        return failure;
    }

    let mut record = body;
    if !record.contains_key("id") {
        record.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
    }
    let record = Value::Object(record);
    let id = record_id(&record);

    let mut records = lock(&api.inner.records);
    let collection = records.entry(entity).or_default();
    // Replays of the same create overwrite
    collection.retain(|r| record_id(r) != id);
    collection.push(record.clone());

    (StatusCode::CREATED, Json(record)).into_response()
}

async fn update(
    State(api): State<MockApi>,
    Path((path, id)): Path<(String, String)>,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    let entity = match resolve(&path) {
        Ok(entity) => entity,
        Err(response) => return response,
    };
    if let Some(failure) = api.begin(entity, Operation::Update).await {
        return failure;
    }

    let mut records = lock(&api.inner.records);
    let existing = records
        .entry(entity)
        .or_default()
        .iter_mut()
        .find(|r| record_id(r).as_deref() == Some(id.as_str()));

    match existing.and_then(Value::as_object_mut) {
        Some(record) => {
            for (key, value) in body {
                if key != "id" {
                    record.insert(key, value);
                }
            }
            Json(Value::Object(record.clone())).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "Record not found"),
    }
}

async fn remove(
    State(api): State<MockApi>,
    Path((path, id)): Path<(String, String)>,
) -> Response {
    let entity = match resolve(&path) {
        Ok(entity) => entity,
        Err(response) => return response,
    };
    if let Some(failure) = api.begin(entity, Operation::Delete).await {
        return failure;
    }

    let mut records = lock(&api.inner.records);
    let collection = records.entry(entity).or_default();
    let before = collection.len();
    collection.retain(|r| record_id(r).as_deref() != Some(id.as_str()));
    if collection.len() == before {
        return error_response(StatusCode::NOT_FOUND, "Record not found");
    }
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    async fn call(api: &MockApi, method: &str, uri: &str, auth: Option<&str>) -> StatusCode {
        let mut request = HttpRequest::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        api.router()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let api = MockApi::new("secret");
        assert_eq!(call(&api, "GET", "/health", None).await, StatusCode::OK);

        api.set_healthy(false);
        assert_eq!(
            call(&api, "GET", "/health", None).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_collections_require_bearer_token() {
        let api = MockApi::new("secret");
        assert_eq!(
            call(&api, "GET", "/notes", None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            call(&api, "GET", "/notes", Some("Basic secret")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            call(&api, "GET", "/notes", Some("Bearer wrong")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            call(&api, "GET", "/notes?patientProfileId=p1", Some("Bearer secret")).await,
            StatusCode::OK
        );
        // Rejected requests are not counted
        assert_eq!(api.calls(EntityType::Notes, Operation::List), 1);
    }

    #[tokio::test]
    async fn test_unknown_record_and_collection_are_404() {
        let api = MockApi::new("secret");
        assert_eq!(
            call(&api, "DELETE", "/notes/missing", Some("Bearer secret")).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            call(&api, "GET", "/profiles", Some("Bearer secret")).await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_failures_run_out() {
        let api = MockApi::new("t");
        api.fail_times(EntityType::Notes, Operation::Create, 500, 2);

        assert!(api.begin(EntityType::Notes, Operation::Create).await.is_some());
        assert!(api.begin(EntityType::Notes, Operation::Create).await.is_some());
        assert!(api.begin(EntityType::Notes, Operation::Create).await.is_none());
        assert_eq!(api.calls(EntityType::Notes, Operation::Create), 3);
    }

    #[tokio::test]
    async fn test_zero_failures_injects_nothing() {
        let api = MockApi::new("t");
        api.fail(EntityType::Notes, Operation::Create, 500);
        api.fail_times(EntityType::Notes, Operation::Create, 500, 0);

        assert!(api.begin(EntityType::Notes, Operation::Create).await.is_none());
        assert!(api.begin(EntityType::Notes, Operation::Create).await.is_none());
    }

    #[tokio::test]
    async fn test_persistent_failure_until_cleared() {
        let api = MockApi::new("t");
        api.fail(EntityType::Notes, Operation::List, 404);

        for _ in 0..5 {
            let response = api.begin(EntityType::Notes, Operation::List).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        api.clear_failures();
        assert!(api.begin(EntityType::Notes, Operation::List).await.is_none());
    }

    #[test]
    fn test_resolve_uses_api_paths() {
        assert_eq!(resolve("intake-events").ok(), Some(EntityType::IntakeEvents));
        assert!(resolve("intakeEvents").is_err());
    }
}
