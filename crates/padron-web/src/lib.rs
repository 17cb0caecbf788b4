//! JSON request surface over identity materialization and association resolution.
//!
//! No authentication here: the owner id in the path is trusted, the fronting gateway checks it.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use padron_identity::{AssociationResolver, IdentityError, Materializer, TagAdmin};
use padron_storage::{IdentityStore, PgStore, RegistryStore, TagStore};
use padron_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub const CRATE_NAME: &str = "padron-web";

const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub materializer: Materializer,
    pub resolver: AssociationResolver,
    pub tags: TagAdmin,
}

impl AppState {
    /// Wires every service to one backend.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: IdentityStore + RegistryStore + TagStore + 'static,
    {
        let materializer = Materializer::new(store.clone(), store.clone());
        Self {
            resolver: AssociationResolver::new(store.clone(), materializer.clone()),
            tags: TagAdmin::new(store),
            materializer,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct MaterializeBody {
    key: String,
}

#[derive(Debug, Deserialize)]
struct MaterializeBatchBody {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReplaceTagsBody {
    registry_row_ids: Vec<i64>,
    #[serde(default)]
    assigned_by: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TagsResponse {
    owner_id: i64,
    registry_row_ids: Vec<i64>,
    added: Vec<i64>,
    removed: Vec<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/owners/{owner}/associations/resolve", post(resolve_handler))
        .route("/owners/{owner}/associations/{id}", delete(end_association_handler))
        .route("/owners/{owner}/tags", put(replace_tags_handler).get(list_tags_handler))
        .route("/registry/materialize", post(materialize_handler))
        .route("/registry/materialize/batch", post(materialize_batch_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "padron web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PADRON_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let config = SyncConfig::from_env();
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to postgres")?;
    serve(AppState::from_store(Arc::new(store)), port).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(owner): AxumPath<i64>,
    Json(body): Json<ResolveBody>,
) -> Response {
    match state.resolver.resolve(body.id, owner).await {
        Ok(association) => Json(association).into_response(),
        Err(err) => identity_error(err),
    }
}

async fn end_association_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((owner, id)): AxumPath<(i64, i64)>,
) -> Response {
    match state.resolver.end(id, owner).await {
        Ok(association) => Json(association).into_response(),
        Err(err) => identity_error(err),
    }
}

async fn replace_tags_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(owner): AxumPath<i64>,
    Json(body): Json<ReplaceTagsBody>,
) -> Response {
    let diff = match state
        .tags
        .replace_tags(owner, &body.registry_row_ids, body.assigned_by)
        .await
    {
        Ok(diff) => diff,
        Err(err) => return identity_error(err),
    };
    match state.tags.list_tagged(owner).await {
        Ok(registry_row_ids) => Json(TagsResponse {
            owner_id: owner,
            registry_row_ids,
            added: diff.added,
            removed: diff.removed,
        })
        .into_response(),
        Err(err) => identity_error(err),
    }
}

async fn list_tags_handler(State(state): State<Arc<AppState>>, AxumPath(owner): AxumPath<i64>) -> Response {
    match state.tags.list_tagged(owner).await {
        Ok(registry_row_ids) => Json(json!({ "owner_id": owner, "registry_row_ids": registry_row_ids })).into_response(),
        Err(err) => identity_error(err),
    }
}

async fn materialize_handler(State(state): State<Arc<AppState>>, Json(body): Json<MaterializeBody>) -> Response {
    match state.materializer.materialize_by_key(&body.key).await {
        Ok(identity) => Json(identity).into_response(),
        Err(err) => identity_error(err),
    }
}

async fn materialize_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MaterializeBatchBody>,
) -> Response {
    Json(state.materializer.materialize_many(&body.keys).await).into_response()
}

fn identity_error(err: IdentityError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        debug!(error = %err, status = status.as_u16(), "request rejected");
    }
    (status, Json(json!({ "error": err.public_message() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use padron_core::RegistryRowDraft;
    use padron_storage::{MemoryStore, UpsertBatch};
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn draft(primary: &str, secondary: Option<&str>, name: &str) -> RegistryRowDraft {
        RegistryRowDraft {
            primary_key: Some(primary.to_string()),
            secondary_key: secondary.map(str::to_string),
            display_name: name.to_string(),
            external_barcode: None,
            balance: None,
            risk_flag: None,
            last_unpaid_period: None,
            full_access_granted: true,
            controls_enabled: 0,
            controls_enabled_raw: None,
            raw_source: "{}".to_string(),
        }
    }

    /// Rows 1 and 2; row 1 tagged to owner 7.
    async fn test_app() -> Router {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_registry_rows(&UpsertBatch {
                secondary: vec![draft("30111222", Some("S-1"), "PEREZ, JUAN")],
                primary: vec![draft("30111333", None, "GOMEZ, ANA")],
            })
            .await
            .unwrap();
        store.tag_registry_row(7, 1, None).await.unwrap();
        app(AppState::from_store(store))
    }

    fn json_request(method: &str, uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = test_app()
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn resolve_then_end_association() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/owners/7/associations/resolve", json!({"id": 1})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let association = read_json(resp).await;
        assert_eq!(association["status"], "active");
        assert_eq!(association["owner_id"], 7);

        let id = association["id"].as_i64().unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/owners/7/associations/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["status"], "ended");
    }

    #[tokio::test]
    async fn foreign_and_untagged_ids_do_not_leak() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/owners/7/associations/resolve", json!({"id": 1})))
            .await
            .unwrap();
        let id = read_json(resp).await["id"].as_i64().unwrap();

        let foreign = app
            .clone()
            .oneshot(json_request("POST", "/owners/8/associations/resolve", json!({"id": id})))
            .await
            .unwrap();
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
        assert_eq!(read_json(foreign).await, json!({"error": "not found"}));

        let untagged = app
            .oneshot(json_request("POST", "/owners/7/associations/resolve", json!({"id": 2})))
            .await
            .unwrap();
        assert_eq!(untagged.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn materialize_hides_credential_and_validates_key() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/registry/materialize", json!({"key": "S-1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let identity = read_json(resp).await;
        assert_eq!(identity["natural_key"], "30111222");
        assert!(identity.get("credential_digest").is_none());

        let empty = app
            .oneshot(json_request("POST", "/registry/materialize", json!({"key": " "})))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn batch_materialize_reports_errors_per_key() {
        let resp = test_app()
            .await
            .oneshot(json_request(
                "POST",
                "/registry/materialize/batch",
                json!({"keys": ["30111333", "40000000"]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = read_json(resp).await;
        assert_eq!(outcome["materialized"].as_array().unwrap().len(), 1);
        assert!(outcome["errors"].get("40000000").is_some());
    }

    #[tokio::test]
    async fn replacing_tags_returns_diff_and_rejects_unknown_rows() {
        let app = test_app().await;
        let resp = app
            .clone()
            .oneshot(json_request("PUT", "/owners/7/tags", json!({"registry_row_ids": [2], "assigned_by": 1})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["added"], json!([2]));
        assert_eq!(body["removed"], json!([1]));
        assert_eq!(body["registry_row_ids"], json!([2]));

        let unknown = app
            .oneshot(json_request("PUT", "/owners/7/tags", json!({"registry_row_ids": [99]})))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }
}
