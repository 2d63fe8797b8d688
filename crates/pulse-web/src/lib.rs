//! Axum JSON API over the sync orchestrator and the metrics store.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use pulse_core::{DailyMetric, Platform, Post, PostMetricRow};
use pulse_storage::{DailyMetricQuery, MetricsStore, PostQuery, PostSortField, SortOrder};
use pulse_sync::SyncOrchestrator;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub mod kpis;

pub const CRATE_NAME: &str = "pulse-web";

const DEFAULT_POST_LIMIT: i64 = 20;
const MAX_POST_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub store: Arc<dyn MetricsStore>,
    /// When set, `/api/cron/sync` requires `Authorization: Bearer <secret>`.
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, cron_secret: Option<String>) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            cron_secret,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/cron/sync", get(cron_sync_handler))
        .route("/api/accounts", get(accounts_handler))
        .route("/api/timeseries", get(timeseries_handler))
        .route("/api/kpis", get(kpis_handler))
        .route("/api/posts", get(posts_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "pulse web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    user_id: Uuid,
    #[serde(default)]
    account_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserQuery {
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsWindowQuery {
    user_id: Uuid,
    from: NaiveDate,
    to: NaiveDate,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    platform: Option<Platform>,
}

impl MetricsWindowQuery {
    fn validate(&self) -> Result<(), Response> {
        if self.from > self.to {
            return Err(bad_request("`from` must not be after `to`"));
        }
        Ok(())
    }

    fn store_query(&self, from: NaiveDate, to: NaiveDate) -> DailyMetricQuery {
        DailyMetricQuery {
            user_id: self.user_id,
            from,
            to,
            account_ref: self.account.clone().filter(|a| !a.is_empty()),
            platform: self.platform,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeseriesQuery {
    user_id: Uuid,
    metric: DailyMetric,
    from: NaiveDate,
    to: NaiveDate,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    platform: Option<Platform>,
}

impl TimeseriesQuery {
    fn into_parts(self) -> (DailyMetric, MetricsWindowQuery) {
        (
            self.metric,
            MetricsWindowQuery {
                user_id: self.user_id,
                from: self.from,
                to: self.to,
                account: self.account,
                platform: self.platform,
            },
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostsQuery {
    user_id: Uuid,
    #[serde(default)]
    platform: Option<Platform>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    sort_by: Option<PostSortField>,
    #[serde(default)]
    sort_order: Option<SortOrder>,
}

#[derive(Debug, Serialize)]
struct AccountEntry {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    platform: Platform,
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Debug, Serialize)]
struct TimeseriesPoint {
    date: NaiveDate,
    value: i64,
}

#[derive(Debug, Serialize)]
struct PostWithMetrics {
    #[serde(flatten)]
    post: Post,
    metrics: Option<PostMetricRow>,
}

#[derive(Debug, Serialize)]
struct PostsResponse {
    posts: Vec<PostWithMetrics>,
    total: i64,
    limit: i64,
    offset: i64,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.health_check().await {
        Ok(()) => Json(json!({ "status": "ok", "backend": state.store.backend_name() })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match state.orchestrator.sync(request.user_id, request.account_id).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(user_id = %request.user_id, error = %err, "manual sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn cron_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.cron_secret {
        let expected = format!("Bearer {secret}");
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" }))).into_response();
        }
    }
    match state.orchestrator.sync_all_users().await {
        Ok(batch) => Json(batch).into_response(),
        Err(err) => {
            error!(error = %err, "cron sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn accounts_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let pages = match state.store.pages(query.user_id).await {
        Ok(pages) => pages,
        Err(err) => return server_error(err),
    };
    let linked = match state.store.linked_accounts(query.user_id).await {
        Ok(linked) => linked,
        Err(err) => return server_error(err),
    };

    let accounts = pages
        .into_iter()
        .map(|page| AccountEntry {
            id: page.page_id.clone(),
            kind: "page",
            name: page.name.unwrap_or_else(|| format!("Page {}", page.page_id)),
            platform: Platform::Facebook,
            reference: page.page_id,
        })
        .chain(linked.into_iter().map(|account| AccountEntry {
            id: account.account_id.clone(),
            kind: "ig",
            name: account
                .username
                .unwrap_or_else(|| format!("IG {}", account.account_id)),
            platform: Platform::Instagram,
            reference: account.account_id,
        }))
        .collect::<Vec<_>>();
    Json(json!({ "accounts": accounts })).into_response()
}

async fn timeseries_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TimeseriesQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let (metric, window) = query.into_parts();
    if let Err(resp) = window.validate() {
        return resp;
    }
    let rows = match state
        .store
        .daily_metrics(&window.store_query(window.from, window.to))
        .await
    {
        Ok(rows) => rows,
        Err(err) => return server_error(err),
    };
    let data = rows
        .iter()
        .map(|row| TimeseriesPoint {
            date: row.date,
            value: row.metrics.get(metric).unwrap_or(0),
        })
        .collect::<Vec<_>>();
    Json(json!({ "data": data })).into_response()
}

async fn kpis_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MetricsWindowQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if let Err(resp) = query.validate() {
        return resp;
    }
    let current = match state.store.daily_metrics(&query.store_query(query.from, query.to)).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err),
    };
    let (prev_from, prev_to) = kpis::previous_window(query.from, query.to);
    let previous = match state.store.daily_metrics(&query.store_query(prev_from, prev_to)).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err),
    };
    Json(kpis::compute_kpis(&current, &previous)).into_response()
}

async fn posts_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PostsQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let limit = query.limit.unwrap_or(DEFAULT_POST_LIMIT);
    if !(1..=MAX_POST_LIMIT).contains(&limit) {
        return bad_request(format!("limit must be between 1 and {MAX_POST_LIMIT}"));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return bad_request("offset must not be negative");
    }

    let page = match state
        .store
        .posts(&PostQuery {
            user_id: query.user_id,
            platform: query.platform,
            limit,
            offset,
            sort_by: query.sort_by.unwrap_or_default(),
            sort_order: query.sort_order.unwrap_or_default(),
        })
        .await
    {
        Ok(page) => page,
        Err(err) => return server_error(err),
    };

    let mut posts = Vec::with_capacity(page.posts.len());
    for post in page.posts {
        let metrics = match state
            .store
            .latest_post_metrics(post.user_id, post.platform, &post.post_id)
            .await
        {
            Ok(metrics) => metrics,
            Err(err) => return server_error(err),
        };
        posts.push(PostWithMetrics { post, metrics });
    }

    Json(PostsResponse {
        posts,
        total: page.total,
        limit,
        offset,
    })
    .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
