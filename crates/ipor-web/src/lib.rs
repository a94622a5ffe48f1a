//! Axum + Askama admin surface for IPO Radar: entity API, single-record
//! upserts from scrapers, duplicate review and merge endpoints.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ipor_core::{FieldAliases, FieldUpdate, GmpSnapshot, IpoEntity, IpoStatus};
use ipor_storage::{IpoStore, PgStore, StoreError};
use ipor_sync::digest::merge_link;
use ipor_sync::{load_field_aliases, DuplicateDetector, EntityMergeResolver, FieldMergeEngine, ResolveError, SyncConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipor-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IpoStore>,
    pub engine: FieldMergeEngine,
    pub detector: DuplicateDetector,
    pub resolver: EntityMergeResolver,
}

impl AppState {
    pub fn new(store: Arc<dyn IpoStore>, config: &SyncConfig) -> anyhow::Result<Self> {
        let aliases = load_field_aliases(&config.workspace_root)?;
        Ok(Self::with_aliases(store, aliases, config))
    }

    pub fn with_aliases(store: Arc<dyn IpoStore>, aliases: FieldAliases, config: &SyncConfig) -> Self {
        Self {
            store,
            engine: FieldMergeEngine::new(aliases),
            detector: DuplicateDetector::with_threshold(config.dedup_threshold),
            resolver: EntityMergeResolver::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct IposQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    keep: Uuid,
    merge: Uuid,
}

struct StatusCountRow {
    label: &'static str,
    count: usize,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    generated_at: String,
    total: usize,
    status_counts: Vec<StatusCountRow>,
    candidates: usize,
}

struct DuplicateRow {
    first_name: String,
    second_name: String,
    score: u8,
    keep_first_url: String,
    keep_second_url: String,
}

#[derive(Template)]
#[template(path = "duplicates.html")]
struct DuplicatesTemplate {
    threshold: u8,
    rows: Vec<DuplicateRow>,
}

#[derive(Template)]
#[template(path = "merge_result.html")]
struct MergeResultTemplate {
    merged: bool,
    kept_name: String,
    merged_name: String,
    message: String,
}

struct FieldRow {
    key: String,
    value: String,
}

#[derive(Template)]
#[template(path = "ipo_detail.html")]
struct IpoDetailTemplate {
    name: String,
    status: String,
    updated_at: String,
    fields: Vec<FieldRow>,
    gmp_trend: Vec<GmpSnapshot>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ipo/{id}", get(ipo_detail_handler))
        .route("/api/ipos", get(list_ipos_handler).post(upsert_ipo_handler))
        .route("/api/ipos/{id}", get(get_ipo_handler))
        .route("/api/admin/duplicates", get(duplicates_json_handler))
        .route("/admin/duplicates", get(duplicates_page_handler))
        .route("/api/admin/merge", post(merge_json_handler))
        .route("/api/merge", get(merge_link_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving IPO Radar admin surface");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = PgStore::connect(&config.database_url).await?;
    let state = AppState::new(Arc::new(store), &config)?;
    serve(state, config.web_port).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let entities = match state.store.list().await {
        Ok(entities) => entities,
        Err(err) => return store_error_page(err),
    };
    let candidates = match state.store.name_index().await {
        Ok(index) => state.detector.detect(&index).len(),
        Err(err) => return store_error_page(err),
    };
    let status_counts = IpoStatus::ALL
        .iter()
        .map(|status| StatusCountRow {
            label: status.as_str(),
            count: entities.iter().filter(|e| e.status == *status).count(),
        })
        .collect();
    render_html(IndexTemplate {
        generated_at: Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
        total: entities.len(),
        status_counts,
        candidates,
    })
}

async fn ipo_detail_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.store.get(id).await {
        Ok(Some(entity)) => render_html(detail_template(entity)),
        Ok(None) => (StatusCode::NOT_FOUND, Html("IPO not found".to_string())).into_response(),
        Err(err) => store_error_page(err),
    }
}

fn detail_template(entity: IpoEntity) -> IpoDetailTemplate {
    let mut gmp_trend = Vec::new();
    let mut fields = Vec::with_capacity(entity.fields.len());
    for (key, value) in &entity.fields {
        match value.as_text() {
            Some(text) => fields.push(FieldRow {
                key: key.clone(),
                value: text.to_string(),
            }),
            None => match value.as_gmp_trend() {
                Some(snapshots) => gmp_trend = snapshots,
                None => fields.push(FieldRow {
                    key: key.clone(),
                    value: serde_json::Value::from(value.clone()).to_string(),
                }),
            },
        }
    }
    IpoDetailTemplate {
        name: entity.name,
        status: entity.status.to_string(),
        updated_at: entity.updated_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        fields,
        gmp_trend,
    }
}

async fn list_ipos_handler(State(state): State<Arc<AppState>>, Query(query): Query<IposQuery>) -> Response {
    let result = match query.status.as_deref().map(str::parse::<IpoStatus>) {
        None => state.store.list().await,
        Some(Ok(status)) => state.store.list_by_status(status).await,
        Some(Err(err)) => return json_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match result {
        Ok(entities) => Json(entities).into_response(),
        Err(err) => store_error_json(err),
    }
}

async fn get_ipo_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.store.get(id).await {
        Ok(Some(entity)) => Json(entity).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, format!("IPO {id} not found")),
        Err(err) => store_error_json(err),
    }
}

async fn upsert_ipo_handler(State(state): State<Arc<AppState>>, Json(update): Json<FieldUpdate>) -> Response {
    match state.engine.apply(state.store.as_ref(), &update, Utc::now()).await {
        Ok(entity) => {
            info!(source = %update.source_id, name = %entity.name, "upserted from API");
            Json(entity).into_response()
        }
        Err(err) => store_error_json(err),
    }
}

async fn duplicates_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.name_index().await {
        Ok(index) => Json(state.detector.detect(&index)).into_response(),
        Err(err) => store_error_json(err),
    }
}

async fn duplicates_page_handler(State(state): State<Arc<AppState>>) -> Response {
    let index = match state.store.name_index().await {
        Ok(index) => index,
        Err(err) => return store_error_page(err),
    };
    let rows = state
        .detector
        .detect(&index)
        .into_iter()
        .map(|c| DuplicateRow {
            keep_first_url: merge_link("", c.first_id, c.second_id),
            keep_second_url: merge_link("", c.second_id, c.first_id),
            first_name: c.first_name,
            second_name: c.second_name,
            score: c.score,
        })
        .collect();
    render_html(DuplicatesTemplate {
        threshold: state.detector.config().threshold,
        rows,
    })
}

async fn merge_json_handler(State(state): State<Arc<AppState>>, Json(req): Json<MergeRequest>) -> Response {
    match state
        .resolver
        .resolve(state.store.as_ref(), req.keep, req.merge, Utc::now())
        .await
    {
        Ok(outcome) => Json(json!({
            "status": "merged",
            "kept": outcome.kept,
            "merged_id": outcome.merged_id,
            "merged_name": outcome.merged_name,
        }))
        .into_response(),
        Err(err) => {
            warn!(keep = %req.keep, merge = %req.merge, error = %err, "merge request failed");
            json_error(resolve_status(&err), err.to_string())
        }
    }
}

/// Target of the one-click links in the admin summary message.
async fn merge_link_handler(State(state): State<Arc<AppState>>, Query(req): Query<MergeRequest>) -> Response {
    match state
        .resolver
        .resolve(state.store.as_ref(), req.keep, req.merge, Utc::now())
        .await
    {
        Ok(outcome) => render_html(MergeResultTemplate {
            merged: true,
            kept_name: outcome.kept.name,
            merged_name: outcome.merged_name,
            message: String::new(),
        }),
        Err(err) => {
            let status = resolve_status(&err);
            let message = match &err {
                ResolveError::NotFound(_) => {
                    "One of these IPOs no longer exists; the pair was probably merged already.".to_string()
                }
                other => other.to_string(),
            };
            let mut resp = render_html(MergeResultTemplate {
                merged: false,
                kept_name: String::new(),
                merged_name: String::new(),
                message,
            });
            *resp.status_mut() = status;
            resp
        }
    }
}

fn resolve_status(err: &ResolveError) -> StatusCode {
    match err {
        ResolveError::NotFound(_) => StatusCode::NOT_FOUND,
        ResolveError::SelfMerge(_) => StatusCode::BAD_REQUEST,
        ResolveError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ResolveError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Backend(_) | StoreError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error_json(err: StoreError) -> Response {
    json_error(store_status(&err), err.to_string())
}

fn store_error_page(err: StoreError) -> Response {
    let status = store_status(&err);
    let mut resp = server_error(anyhow::Error::new(err));
    *resp.status_mut() = status;
    resp
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{DateTime, TimeZone};
    use http_body_util::BodyExt;
    use ipor_core::FieldValue;
    use ipor_storage::InMemoryStore;
    use tower::ServiceExt;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 9, 3, 30, 0).unwrap()
    }

    async fn seeded() -> (Arc<InMemoryStore>, Uuid, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let keep = store
            .upsert(
                &FieldUpdate::new("chittorgarh", "Bharat Coking Coal")
                    .with_status(IpoStatus::Open)
                    .with_field("gmp", FieldValue::text("₹4")),
                ts(),
            )
            .await
            .unwrap()
            .id;
        let merge = store
            .upsert(
                &FieldUpdate::new("investorgain", "Bharat Coking Coal Ltd")
                    .with_field("subscription", FieldValue::text("12.5x")),
                ts(),
            )
            .await
            .unwrap()
            .id;
        (store, keep, merge)
    }

    fn test_app(store: Arc<InMemoryStore>) -> Router {
        app(AppState::with_aliases(store, FieldAliases::builtin(), &SyncConfig::default()))
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn index_shows_counts() {
        let (store, _, _) = seeded().await;
        let resp = test_app(store).oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("IPO Radar"));
        assert!(text.contains("Duplicate candidates"));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_rejects_unknown_labels() {
        let (store, keep, _) = seeded().await;
        let app = test_app(store);
        let resp = app.clone().oneshot(get("/api/ipos?status=open")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let listed: Vec<IpoEntity> = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, keep);

        let resp = app.oneshot(get("/api/ipos?status=listed")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upsert_canonicalizes_and_keeps_known_status_and_fields() {
        let (store, keep, _) = seeded().await;
        let app = test_app(store.clone());
        let resp = app
            .oneshot(post_json(
                "/api/ipos",
                json!({
                    "source_id": "groww",
                    "name": "Bharat Coking Coal",
                    "status": "unknown",
                    "fields": {"Overall Subscription": "3.1x"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let entity = store.get(keep).await.unwrap().unwrap();
        assert_eq!(entity.text("subscription"), Some("3.1x"));
        assert_eq!(entity.text("gmp"), Some("₹4"));
        assert_eq!(entity.status, IpoStatus::Open);
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let (store, _, _) = seeded().await;
        let resp = test_app(store)
            .oneshot(post_json("/api/ipos", json!({"source_id": "groww", "name": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_review_lists_the_pair() {
        let (store, keep, merge) = seeded().await;
        let app = test_app(store);
        let resp = app.clone().oneshot(get("/api/admin/duplicates")).await.unwrap();
        let candidates: Vec<ipor_core::DuplicateCandidate> =
            serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].score, 90);

        let page = body_text(app.oneshot(get("/admin/duplicates")).await.unwrap()).await;
        assert!(page.contains(&format!("keep={keep}&amp;merge={merge}")));
        assert!(page.contains(&format!("keep={merge}&amp;merge={keep}")));
    }

    #[tokio::test]
    async fn json_merge_maps_errors_to_statuses() {
        let (store, keep, merge) = seeded().await;
        let app = test_app(store.clone());

        let same = app
            .clone()
            .oneshot(post_json("/api/admin/merge", json!({"keep": keep, "merge": keep})))
            .await
            .unwrap();
        assert_eq!(same.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .clone()
            .oneshot(post_json("/api/admin/merge", json!({"keep": keep, "merge": merge})))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let kept = store.get(keep).await.unwrap().unwrap();
        assert_eq!(kept.text("subscription"), Some("12.5x"));
        assert!(store.find_by_name("Bharat Coking Coal Ltd").await.unwrap().is_none());

        let again = app
            .oneshot(post_json("/api/admin/merge", json!({"keep": keep, "merge": merge})))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn one_click_link_merges_once_then_reports_stale() {
        let (store, keep, merge) = seeded().await;
        let app = test_app(store);
        let uri = format!("/api/merge?keep={keep}&merge={merge}");

        let first = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(body_text(first).await.contains("Merge Successful"));

        let second = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
        assert!(body_text(second).await.contains("Merge Not Applied"));
    }

    #[tokio::test]
    async fn unavailable_store_is_reported_as_503() {
        let (store, keep, _) = seeded().await;
        store.set_unavailable(true);
        let resp = test_app(store).oneshot(get(&format!("/api/ipos/{keep}"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn detail_page_renders_fields() {
        let (store, keep, _) = seeded().await;
        let resp = test_app(store).oneshot(get(&format!("/ipo/{keep}"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Bharat Coking Coal"));
        assert!(text.contains("₹4"));
    }
}
