use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing,
};
use chrono::{DateTime, Utc};
use concepts::{
    Document, DocumentPath, EventId, HandlerName, PathParseError,
    storage::{DbErrorGeneric, DbErrorRead, DbErrorWrite, DbPool, DocumentUpdate},
    time::{ClockFn as _, Now, TimeWindow},
};
use guard::handler::HandlerDecl;
use guard::tagger;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lookback of the listing endpoints when `from` is not given.
const DEFAULT_LIST_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub(crate) struct WebApiState {
    pub(crate) db_pool: Arc<dyn DbPool>,
    pub(crate) handler_decls: Arc<[HandlerDecl]>,
}

pub(crate) fn app_router(state: WebApiState) -> Router {
    Router::new()
        .nest("/v1", v1_router())
        .with_state(Arc::new(state))
}

fn v1_router() -> Router<Arc<WebApiState>> {
    Router::new()
        .route("/alerts", routing::get(alerts_list))
        .route(
            "/documents/{*path}",
            routing::get(document_get)
                .post(document_create)
                .put(document_update)
                .delete(document_delete),
        )
        .route("/failures", routing::get(failures_list))
        .route("/handlers", routing::get(handlers_list))
        .route("/ledger/{event-id}", routing::get(ledger_entry_get))
        .route("/samples", routing::get(samples_list))
}

fn parse_path(path: &str) -> Result<DocumentPath, HttpResponse> {
    path.parse()
        .map_err(|err: PathParseError| HttpResponse::bad_request(err.to_string()))
}

async fn document_get(
    Path(path): Path<String>,
    state: State<Arc<WebApiState>>,
) -> Result<Response, HttpResponse> {
    let path = parse_path(&path)?;
    let document = state
        .db_pool
        .document_store()
        .get(&path)
        .await
        .map_err(ErrorWrapper)?;
    Ok(Json(document).into_response())
}

/// Client writes clear the writer tag, so handlers never mistake them for their own echo.
async fn document_create(
    Path(path): Path<String>,
    state: State<Arc<WebApiState>>,
    Json(document): Json<Document>,
) -> Result<Response, HttpResponse> {
    let path = parse_path(&path)?;
    let now = Now.now();
    let change_id = state
        .db_pool
        .document_store()
        .create(&path, tagger::untag_document(document, now), now)
        .await
        .map_err(ErrorWrapper)?;
    debug!(%path, %change_id, "Document created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "change_id": change_id.to_string() })),
    )
        .into_response())
}

async fn document_update(
    Path(path): Path<String>,
    state: State<Arc<WebApiState>>,
    Json(update): Json<DocumentUpdate>,
) -> Result<Response, HttpResponse> {
    let path = parse_path(&path)?;
    let now = Now.now();
    let change_id = state
        .db_pool
        .document_store()
        .update(&path, tagger::untag(update, now), now)
        .await
        .map_err(ErrorWrapper)?;
    debug!(%path, %change_id, "Document updated");
    Ok(Json(json!({ "change_id": change_id.to_string() })).into_response())
}

async fn document_delete(
    Path(path): Path<String>,
    state: State<Arc<WebApiState>>,
) -> Result<Response, HttpResponse> {
    let path = parse_path(&path)?;
    let change_id = state
        .db_pool
        .document_store()
        .delete(&path, Now.now())
        .await
        .map_err(ErrorWrapper)?;
    debug!(%path, %change_id, "Document deleted");
    Ok(Json(json!({ "change_id": change_id.to_string() })).into_response())
}

/// `from` is inclusive, `to` exclusive, both RFC 3339.
#[derive(Deserialize, Debug)]
struct ListParams {
    handler: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl ListParams {
    fn handler_name(&self) -> Option<HandlerName> {
        self.handler.as_deref().map(HandlerName::from)
    }

    fn window(&self) -> Result<TimeWindow, HttpResponse> {
        let end = self.to.unwrap_or_else(|| Now.now());
        let window = match self.from {
            Some(start) => TimeWindow { start, end },
            None => TimeWindow::trailing(end, DEFAULT_LIST_WINDOW),
        };
        if window.start > window.end {
            return Err(HttpResponse::bad_request(
                "`from` must not be later than `to`".to_string(),
            ));
        }
        Ok(window)
    }
}

async fn failures_list(
    Query(params): Query<ListParams>,
    state: State<Arc<WebApiState>>,
) -> Result<Response, HttpResponse> {
    let failures = state
        .db_pool
        .error_sink()
        .list_failures(params.handler_name().as_ref(), params.window()?)
        .await
        .map_err(ErrorWrapper)?;
    Ok(Json(failures).into_response())
}

async fn alerts_list(
    Query(params): Query<ListParams>,
    state: State<Arc<WebApiState>>,
) -> Result<Response, HttpResponse> {
    let mut alerts = state
        .db_pool
        .monitor_store()
        .list_alerts(params.window()?)
        .await
        .map_err(ErrorWrapper)?;
    if let Some(handler_name) = params.handler_name() {
        alerts.retain(|alert| alert.handler_name == handler_name);
    }
    Ok(Json(alerts).into_response())
}

async fn samples_list(
    Query(params): Query<ListParams>,
    state: State<Arc<WebApiState>>,
) -> Result<Response, HttpResponse> {
    let samples = state
        .db_pool
        .monitor_store()
        .list_samples(params.handler_name().as_ref(), params.window()?)
        .await
        .map_err(ErrorWrapper)?;
    Ok(Json(samples).into_response())
}

async fn handlers_list(state: State<Arc<WebApiState>>) -> Response {
    Json(&*state.handler_decls).into_response()
}

async fn ledger_entry_get(
    Path(event_id): Path<String>,
    state: State<Arc<WebApiState>>,
) -> Result<Response, HttpResponse> {
    let entry = state
        .db_pool
        .event_ledger()
        .get_entry(&EventId::new(event_id))
        .await
        .map_err(ErrorWrapper)?;
    Ok(Json(entry).into_response())
}

struct ErrorWrapper<E>(E);

#[derive(Debug)]
pub(crate) struct HttpResponse {
    status: StatusCode,
    message: String,
}

impl HttpResponse {
    fn not_found() -> Self {
        HttpResponse {
            status: StatusCode::NOT_FOUND,
            message: "not found".to_string(),
        }
    }

    fn bad_request(message: String) -> Self {
        HttpResponse {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(if self.status.is_success() {
                json!({ "ok": self.message })
            } else {
                json!({ "err": self.message })
            }),
        )
            .into_response()
    }
}

impl From<ErrorWrapper<DbErrorGeneric>> for HttpResponse {
    #[track_caller]
    fn from(value: ErrorWrapper<DbErrorGeneric>) -> Self {
        let err = value.0;
        let loc = std::panic::Location::caller();
        let (loc_file, loc_line) = (loc.file(), loc.line());
        warn!(loc_file, loc_line, "{err:?}");
        HttpResponse {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "database error".to_string(),
        }
    }
}

impl From<ErrorWrapper<DbErrorRead>> for HttpResponse {
    #[track_caller]
    fn from(value: ErrorWrapper<DbErrorRead>) -> Self {
        match value.0 {
            DbErrorRead::NotFound => HttpResponse::not_found(),
            DbErrorRead::Generic(err) => HttpResponse::from(ErrorWrapper(err)),
        }
    }
}

impl From<ErrorWrapper<DbErrorWrite>> for HttpResponse {
    #[track_caller]
    fn from(value: ErrorWrapper<DbErrorWrite>) -> Self {
        match value.0 {
            DbErrorWrite::NotFound => HttpResponse::not_found(),
            DbErrorWrite::AlreadyExists => HttpResponse {
                status: StatusCode::CONFLICT,
                message: "already exists".to_string(),
            },
            DbErrorWrite::ValidationFailed(reason) => {
                HttpResponse::bad_request(format!("validation failed: {reason}"))
            }
            DbErrorWrite::Generic(err) => HttpResponse::from(ErrorWrapper(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeDelta;
    use concepts::storage::{DbPoolCloseable as _, FailureRecord};
    use concepts::LAST_MODIFIED_BY;
    use db_mem::inmemory_dao::InMemoryPool;
    use http::Request;
    use http_body_util::BodyExt as _;
    use serde_json::Value;
    use tower::ServiceExt as _;

    fn router(db_pool: &InMemoryPool) -> Router {
        let handler_decls = handlers::all()
            .unwrap()
            .iter()
            .map(|handler| handler.decl().clone())
            .collect();
        app_router(WebApiState {
            db_pool: Arc::new(db_pool.clone()),
            handler_decls,
        })
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn document_lifecycle() {
        test_utils::set_up();
        let db_pool = InMemoryPool::new();
        let router = router(&db_pool);
        let uri = "/v1/documents/tenants/t1/users/u1";

        let (status, _) = call(&router, "GET", uri, None).await;
        assert_eq!(StatusCode::NOT_FOUND, status);

        let (status, body) = call(&router, "POST", uri, Some(json!({"lastSeen": "T0"}))).await;
        assert_eq!(StatusCode::CREATED, status, "{body}");
        let (status, _) = call(&router, "POST", uri, Some(json!({"lastSeen": "T0"}))).await;
        assert_eq!(StatusCode::CONFLICT, status);

        let (status, _) = call(
            &router,
            "PUT",
            uri,
            Some(json!({"set": {"lastSeen": "T1"}, "increments": {"loginCount": 2}})),
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        let (status, body) = call(&router, "GET", uri, None).await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!("T1"), body["lastSeen"]);
        assert_eq!(json!(2), body["loginCount"]);
        assert_eq!(Value::Null, body[LAST_MODIFIED_BY]);

        let (status, _) = call(&router, "DELETE", uri, None).await;
        assert_eq!(StatusCode::OK, status);
        let (status, _) = call(&router, "DELETE", uri, None).await;
        assert_eq!(StatusCode::NOT_FOUND, status);
        db_pool.close().await;
    }

    #[tokio::test]
    async fn client_write_clears_the_writer_tag() {
        test_utils::set_up();
        let db_pool = InMemoryPool::new();
        let path: DocumentPath = "tenants/t1/users/u1".parse().unwrap();
        db_pool
            .document_store()
            .update(
                &path,
                DocumentUpdate::default().set(LAST_MODIFIED_BY, handlers::login_count::NAME),
                Now.now(),
            )
            .await
            .unwrap();
        let router = router(&db_pool);
        let (status, _) = call(
            &router,
            "PUT",
            "/v1/documents/tenants/t1/users/u1",
            Some(json!({"set": {"lastSeen": "T2"}})),
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        let stored = db_pool.document_store().get(&path).await.unwrap();
        assert_eq!(Some(&Value::Null), stored.get(LAST_MODIFIED_BY));
        db_pool.close().await;
    }

    #[tokio::test]
    async fn invalid_path_is_rejected() {
        test_utils::set_up();
        let db_pool = InMemoryPool::new();
        let (status, body) = call(&router(&db_pool), "GET", "/v1/documents/tenants/t1/users", None).await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert!(body["err"].as_str().unwrap().contains("even number"), "{body}");
        db_pool.close().await;
    }

    #[tokio::test]
    async fn failures_are_filtered_by_handler() {
        test_utils::set_up();
        let db_pool = InMemoryPool::new();
        let occurred_at = Now.now() - TimeDelta::seconds(1);
        for handler_name in ["a", "b"] {
            db_pool
                .error_sink()
                .append_failure(FailureRecord {
                    handler_name: HandlerName::from(handler_name),
                    event_id: EventId::new(format!("event-{handler_name}")),
                    document_path: "tenants/t1/users/u1".parse().unwrap(),
                    error: "boom".to_string(),
                    occurred_at,
                })
                .await
                .unwrap();
        }
        let router = router(&db_pool);
        let (status, body) = call(&router, "GET", "/v1/failures", None).await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(2, body.as_array().unwrap().len());
        let (_, body) = call(&router, "GET", "/v1/failures?handler=b", None).await;
        assert_eq!(json!("b"), body[0]["handler_name"]);
        assert_eq!(1, body.as_array().unwrap().len());
        db_pool.close().await;
    }

    #[tokio::test]
    async fn listing_window_is_validated() {
        test_utils::set_up();
        let db_pool = InMemoryPool::new();
        let router = router(&db_pool);
        let (status, _) = call(
            &router,
            "GET",
            "/v1/alerts?from=2024-01-02T00:00:00Z&to=2024-01-01T00:00:00Z",
            None,
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, status);
        let (status, body) = call(
            &router,
            "GET",
            "/v1/samples?from=2024-01-01T00:00:00Z&to=2024-01-02T00:00:00Z",
            None,
        )
        .await;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(json!([]), body);
        db_pool.close().await;
    }

    #[tokio::test]
    async fn handlers_are_listed() {
        test_utils::set_up();
        let db_pool = InMemoryPool::new();
        let (status, body) = call(&router(&db_pool), "GET", "/v1/handlers", None).await;
        assert_eq!(StatusCode::OK, status);
        let names: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|decl| decl["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&handlers::login_count::NAME.to_string()), "{names:?}");
        db_pool.close().await;
    }

    #[tokio::test]
    async fn unknown_ledger_entry_is_not_found() {
        test_utils::set_up();
        let db_pool = InMemoryPool::new();
        let (status, _) = call(&router(&db_pool), "GET", "/v1/ledger/missing", None).await;
        assert_eq!(StatusCode::NOT_FOUND, status);
        db_pool.close().await;
    }
}
