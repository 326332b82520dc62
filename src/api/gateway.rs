//! REST gateway in front of the cluster
//!
//! - `POST /put` with `{"key": .., "value": {record}}`
//! - `GET /get?key=..`
//! - `GET /search?name=..&class=..&major=..&grand=..&course_count=..&total_credits=..`
//! - `GET /list_all`
//!
//! Records are returned with their key added as an `id` field. Every call
//! goes through a `Clerk`, which does leader discovery and retries.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::kv::client::{Clerk, ClientError, KvService};
use crate::kv::server::KvError;
use crate::state_machine::StudentRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: StudentRecord,
}

/// A record as served to browsers: the stored fields plus its key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub id: String,
    #[serde(flatten)]
    pub record: StudentRecord,
}

/// Search conditions; empty parameters are ignored
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub name: Option<String>,
    pub class: Option<String>,
    pub major: Option<String>,
    pub grand: Option<String>,
    pub course_count: Option<String>,
    pub total_credits: Option<String>,
}

fn condition(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl SearchQuery {
    pub fn is_empty(&self) -> bool {
        [
            &self.name,
            &self.class,
            &self.major,
            &self.grand,
            &self.course_count,
            &self.total_credits,
        ]
        .into_iter()
        .all(|v| condition(v).is_none())
    }

    /// Every given condition must hold; unparseable numbers match nothing
    pub fn matches(&self, record: &StudentRecord) -> bool {
        if condition(&self.name).is_some_and(|name| record.name != name) {
            return false;
        }
        if condition(&self.class).is_some_and(|class| record.class != class) {
            return false;
        }
        if condition(&self.major).is_some_and(|major| record.major != major) {
            return false;
        }
        if condition(&self.grand).is_some_and(|grand| record.grand.to_string() != grand) {
            return false;
        }
        if let Some(count) = condition(&self.course_count) {
            if count.parse::<i64>().ok() != Some(record.course_count) {
                return false;
            }
        }
        if let Some(credits) = condition(&self.total_credits) {
            if credits.parse::<f64>().ok() != Some(record.total_credits) {
                return false;
            }
        }
        true
    }
}

/// Create the gateway router with permissive CORS
///
/// All requests share one client session, so Gets and Puts from concurrent
/// requests reach the cluster one at a time.
pub fn create_gateway_router<S: KvService + 'static>(clerk: Arc<Clerk<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/put", post(handle_put::<S>))
        .route("/get", get(handle_get::<S>))
        .route("/search", get(handle_search::<S>))
        .route("/list_all", get(handle_list_all::<S>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(clerk)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn unavailable(e: &ClientError) -> Response {
    warn!(error = %e, "cluster request failed");
    error_response(StatusCode::SERVICE_UNAVAILABLE, format!("cluster unavailable: {}", e))
}

async fn handle_put<S: KvService + 'static>(
    State(clerk): State<Arc<Clerk<S>>>,
    Json(request): Json<PutRequest>,
) -> Response {
    match clerk.put(&request.key, request.value).await {
        Ok(()) => Json(json!({
            "message": format!("Put operation successful for key: {}", request.key)
        }))
        .into_response(),
        Err(e) => unavailable(&e),
    }
}

async fn handle_get<S: KvService + 'static>(
    State(clerk): State<Arc<Clerk<S>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(key) = params.get("key").filter(|k| !k.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Key is required");
    };
    match clerk.get(key).await {
        Ok(record) => Json(RecordView {
            id: key.clone(),
            record,
        })
        .into_response(),
        Err(e) if e.kv() == Some(&KvError::NoKey) => error_response(StatusCode::NOT_FOUND, "Key not found"),
        Err(e) => unavailable(&e),
    }
}

async fn handle_search<S: KvService + 'static>(
    State(clerk): State<Arc<Clerk<S>>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    if query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "At least one condition is required");
    }
    match all_records(&clerk).await {
        Ok(records) => Json(
            records
                .into_iter()
                .filter(|view| query.matches(&view.record))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => unavailable(&e),
    }
}

async fn handle_list_all<S: KvService + 'static>(State(clerk): State<Arc<Clerk<S>>>) -> Response {
    match all_records(&clerk).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => unavailable(&e),
    }
}

/// Fetch every record; keys that vanish or fail between listing and reading are skipped
async fn all_records<S: KvService>(clerk: &Clerk<S>) -> Result<Vec<RecordView>, ClientError> {
    let keys = clerk.list_keys().await?;
    let mut records = Vec::with_capacity(keys.len());
    for key in keys {
        match clerk.get(&key).await {
            Ok(record) => records.push(RecordView { id: key, record }),
            Err(e) => warn!(key = %key, error = %e, "skipping record"),
        }
    }
    Ok(records)
}
