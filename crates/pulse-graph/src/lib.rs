//! Meta Graph API client contracts, the reqwest-backed client, and wire decoding.
//!
//! The client is deliberately thin: one request per call, no retries and no pagination.
//! Whether to retry or skip is decided by the caller.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use pulse_core::{Insight, InsightSample, LinkedAccount, PageAccount, Platform, Post};
use reqwest::header::ACCEPT;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, debug_span, Instrument};
use uuid::Uuid;

pub mod fixture;

pub use fixture::{FixtureGraph, FixtureGraphConnector, GraphFixture};

pub const CRATE_NAME: &str = "pulse-graph";

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v21.0";

const MEDIA_FIELDS: &str =
    "id,caption,media_type,permalink,thumbnail_url,timestamp,like_count,comments_count";

/// OAuth error code Meta returns for expired or revoked tokens.
const OAUTH_TOKEN_ERROR_CODE: i64 = 190;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("graph api error (status {status}): {message}")]
    Status {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    #[error("malformed graph api response: {0}")]
    Malformed(String),
    #[error("graph api request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ApiError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(err) => err.status().map(|s| s.as_u16()),
            ApiError::Malformed(_) => None,
        }
    }

    /// True when the provider rejected the access token itself.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            ApiError::Status { code: Some(OAUTH_TOKEN_ERROR_CODE), .. } | ApiError::Status { status: 401, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPage {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Page-scoped delegated token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl GraphPage {
    pub fn to_page_account(&self, user_id: Uuid) -> PageAccount {
        PageAccount {
            user_id,
            page_id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphLinkedAccount {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl GraphLinkedAccount {
    pub fn to_linked_account(&self, user_id: Uuid) -> LinkedAccount {
        LinkedAccount {
            user_id,
            account_id: self.id.clone(),
            username: self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInsight {
    pub name: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub values: Vec<GraphInsightValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInsightValue {
    #[serde(default)]
    pub value: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

impl GraphInsight {
    /// Decodes into the core shape. `null` values count as 0; breakdown objects are
    /// skipped because they do not fit a single numeric column.
    pub fn into_insight(self) -> Result<Insight, ApiError> {
        let mut values = Vec::with_capacity(self.values.len());
        for sample in self.values {
            let value = match &sample.value {
                JsonValue::Null => 0,
                JsonValue::Number(n) => match n.as_i64() {
                    Some(v) => v,
                    None => n.as_f64().map(|f| f.round() as i64).unwrap_or_default(),
                },
                other => {
                    debug!(metric = %self.name, value = %other, "skipping non-numeric insight value");
                    continue;
                }
            };
            let end_time = match sample.end_time.as_deref() {
                Some(raw) => Some(parse_graph_timestamp(raw).ok_or_else(|| {
                    ApiError::Malformed(format!("bad end_time {raw:?} for {}", self.name))
                })?),
                None => None,
            };
            values.push(InsightSample { value, end_time });
        }
        Ok(Insight {
            name: self.name,
            values,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMedia {
    pub id: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default = "default_media_type")]
    pub media_type: String,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub comments_count: Option<i64>,
}

fn default_media_type() -> String {
    "UNKNOWN".to_string()
}

impl GraphMedia {
    pub fn to_post(&self, user_id: Uuid, platform: Platform) -> Result<Post, ApiError> {
        let created_time = parse_graph_timestamp(&self.timestamp)
            .ok_or_else(|| ApiError::Malformed(format!("bad media timestamp {:?}", self.timestamp)))?
            .with_timezone(&Utc);
        Ok(Post {
            user_id,
            platform,
            post_id: self.id.clone(),
            created_time,
            caption: self.caption.clone(),
            media_type: self.media_type.clone(),
            permalink: self.permalink.clone(),
            like_count: self.like_count.unwrap_or(0),
            comment_count: self.comments_count.unwrap_or(0),
            thumbnail_url: self.thumbnail_url.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LinkedAccountEnvelope {
    #[serde(default)]
    instagram_business_account: Option<GraphLinkedAccount>,
}

/// Accepts both RFC 3339 and Graph's `2026-03-01T08:00:00+0000` form.
pub fn parse_graph_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
}

/// Short, non-reversible token identifier for logs.
pub fn token_fingerprint(access_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// Read operations available with one access token.
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn list_pages(&self) -> Result<Vec<GraphPage>, ApiError>;

    /// `None` when the page has no linked business account.
    async fn linked_account(&self, page_id: &str) -> Result<Option<GraphLinkedAccount>, ApiError>;

    /// Daily insights for an Instagram business account or a page.
    async fn account_insights(
        &self,
        account_id: &str,
        metrics: &[String],
        since: &str,
        until: &str,
    ) -> Result<Vec<Insight>, ApiError>;

    async fn list_media(&self, account_id: &str, limit: usize) -> Result<Vec<GraphMedia>, ApiError>;

    /// Lifetime-to-date insights of one media item.
    async fn media_insights(
        &self,
        media_id: &str,
        metrics: &[String],
    ) -> Result<Vec<Insight>, ApiError>;
}

/// Builds a [`GraphApi`] bound to one access token.
pub trait GraphConnector: Send + Sync {
    fn connect(&self, access_token: &str) -> Box<dyn GraphApi>;
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Shares one reqwest connection pool across every per-token client.
#[derive(Debug, Clone)]
pub struct HttpGraphConnector {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGraphConnector {
    pub fn new(config: GraphConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder.build().context("building reqwest client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl GraphConnector for HttpGraphConnector {
    fn connect(&self, access_token: &str) -> Box<dyn GraphApi> {
        Box::new(GraphClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            access_token: access_token.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl GraphClient {
    pub fn new(config: GraphConfig, access_token: impl Into<String>) -> anyhow::Result<Self> {
        let connector = HttpGraphConnector::new(config)?;
        Ok(Self {
            http: connector.http,
            base_url: connector.base_url,
            access_token: access_token.into(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let span = debug_span!("graph_request", path, token = %token_fingerprint(&self.access_token));
        async move {
            let resp = self
                .http
                .get(&url)
                .header(ACCEPT, "application/json")
                .query(&[("access_token", self.access_token.as_str())])
                .query(params)
                .send()
                .await?;
            let status = resp.status();
            let body = resp.bytes().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "graph response");

            let value: JsonValue = match serde_json::from_slice(&body) {
                Ok(value) => value,
                Err(_) if !status.is_success() => {
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        code: None,
                        message: format!("HTTP {status}"),
                    });
                }
                Err(err) => return Err(ApiError::Malformed(err.to_string())),
            };

            if let Some(error) = value.get("error") {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    code: error.get("code").and_then(|c| c.as_i64()),
                    message: error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("HTTP {status}")),
                });
            }
            if !status.is_success() {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    code: None,
                    message: format!("HTTP {status}"),
                });
            }

            serde_json::from_value(value).map_err(|err| ApiError::Malformed(err.to_string()))
        }
        .instrument(span)
        .await
    }

    async fn insights(
        &self,
        path: String,
        params: Vec<(&str, String)>,
    ) -> Result<Vec<Insight>, ApiError> {
        let envelope: DataEnvelope<GraphInsight> = self.get_json(&path, &params).await?;
        envelope
            .data
            .into_iter()
            .map(GraphInsight::into_insight)
            .collect()
    }
}

#[async_trait]
impl GraphApi for GraphClient {
    async fn list_pages(&self) -> Result<Vec<GraphPage>, ApiError> {
        let envelope: DataEnvelope<GraphPage> = self
            .get_json("/me/accounts", &[("fields", "id,name,access_token".to_string())])
            .await?;
        Ok(envelope.data)
    }

    async fn linked_account(&self, page_id: &str) -> Result<Option<GraphLinkedAccount>, ApiError> {
        let envelope: LinkedAccountEnvelope = self
            .get_json(
                &format!("/{page_id}"),
                &[("fields", "instagram_business_account{id,username}".to_string())],
            )
            .await?;
        Ok(envelope.instagram_business_account)
    }

    async fn account_insights(
        &self,
        account_id: &str,
        metrics: &[String],
        since: &str,
        until: &str,
    ) -> Result<Vec<Insight>, ApiError> {
        self.insights(
            format!("/{account_id}/insights"),
            vec![
                ("metric", metrics.join(",")),
                ("since", since.to_string()),
                ("until", until.to_string()),
                ("period", "day".to_string()),
            ],
        )
        .await
    }

    async fn list_media(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<GraphMedia>, ApiError> {
        let envelope: DataEnvelope<GraphMedia> = self
            .get_json(
                &format!("/{account_id}/media"),
                &[("fields", MEDIA_FIELDS.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        let mut media = envelope.data;
        media.truncate(limit);
        Ok(media)
    }

    async fn media_insights(
        &self,
        media_id: &str,
        metrics: &[String],
    ) -> Result<Vec<Insight>, ApiError> {
        self.insights(
            format!("/{media_id}/insights"),
            vec![("metric", metrics.join(","))],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_graph(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v21.0")
    }

    fn client(base_url: String) -> GraphClient {
        GraphClient::new(
            GraphConfig {
                base_url,
                ..Default::default()
            },
            "tok-abc",
        )
        .unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn accounts(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        if q.get("access_token").map(String::as_str) != Some("tok-abc") {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "Invalid OAuth access token.", "code": 190}})),
            );
        }
        (
            StatusCode::OK,
            Json(json!({"data": [{"id": "p1", "name": "Bakery", "access_token": "page-tok"}]})),
        )
    }

    async fn node(Path(id): Path<String>) -> impl IntoResponse {
        match id.as_str() {
            "p1" => Json(json!({"id": "p1", "instagram_business_account": {"id": "ig1", "username": "bakery"}})),
            _ => Json(json!({"id": id})),
        }
    }

    async fn insights(Path(id): Path<String>, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        match id.as_str() {
            "ig1" => {
                assert_eq!(q.get("period").map(String::as_str), Some("day"));
                assert_eq!(q.get("metric").map(String::as_str), Some("impressions,reach"));
                (
                    StatusCode::OK,
                    Json(json!({"data": [
                        {"name": "impressions", "period": "day", "values": [
                            {"value": 12, "end_time": "2026-03-01T08:00:00+0000"},
                            {"value": null, "end_time": "2026-03-02T08:00:00+0000"}
                        ]},
                        {"name": "reach", "period": "day", "values": [
                            {"value": {"organic": 3}, "end_time": "2026-03-01T08:00:00+0000"}
                        ]}
                    ]})),
                )
            }
            "empty" => (StatusCode::OK, Json(json!({}))),
            _ => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "(#100) Invalid metric", "code": 100}})),
            ),
        }
    }

    async fn media(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        assert_eq!(q.get("limit").map(String::as_str), Some("2"));
        Json(json!({"data": [
            {"id": "m1", "media_type": "IMAGE", "timestamp": "2026-03-01T10:00:00+0000", "like_count": 7, "comments_count": 2},
            {"id": "m2", "media_type": "VIDEO", "timestamp": "2026-03-02T10:00:00+0000"},
            {"id": "m3", "media_type": "IMAGE", "timestamp": "2026-03-03T10:00:00+0000"}
        ]}))
    }

    fn graph_router() -> Router {
        Router::new()
            .route("/v21.0/me/accounts", get(accounts))
            .route("/v21.0/{id}", get(node))
            .route("/v21.0/{id}/insights", get(insights))
            .route("/v21.0/{id}/media", get(media))
            .route("/v21.0/broken/media", get(|| async { "not json" }))
    }

    #[tokio::test]
    async fn pages_and_linked_account_decode() {
        let base = spawn_graph(graph_router()).await;
        let client = client(base);

        let pages = client.list_pages().await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].name.as_deref(), Some("Bakery"));
        assert_eq!(pages[0].access_token.as_deref(), Some("page-tok"));

        let linked = client.linked_account("p1").await.unwrap().unwrap();
        assert_eq!(linked.id, "ig1");
        assert!(client.linked_account("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insights_decode_values_and_timestamps() {
        let base = spawn_graph(graph_router()).await;
        let client = client(base);
        let insights = client
            .account_insights("ig1", &strings(&["impressions", "reach"]), "2026-03-01", "2026-03-02")
            .await
            .unwrap();
        assert_eq!(insights.len(), 2);
        let impressions = &insights[0];
        assert_eq!(impressions.values.len(), 2);
        assert_eq!(impressions.values[0].value, 12);
        assert_eq!(impressions.values[1].value, 0);
        assert_eq!(
            impressions.values[0].end_time.unwrap().with_timezone(&Utc).to_rfc3339(),
            "2026-03-01T08:00:00+00:00"
        );
        assert!(insights[1].values.is_empty());

        let empty = client
            .account_insights("empty", &strings(&["reach"]), "2026-03-01", "2026-03-02")
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn error_envelope_maps_to_status_error() {
        let base = spawn_graph(graph_router()).await;
        let err = client(base.clone())
            .media_insights("m1", &strings(&["saved"]))
            .await
            .unwrap_err();
        match &err {
            ApiError::Status { status, code, message } => {
                assert_eq!(*status, 400);
                assert_eq!(*code, Some(100));
                assert!(message.contains("Invalid metric"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!err.is_token_error());

        let bad_token = GraphClient::new(
            GraphConfig {
                base_url: base,
                ..Default::default()
            },
            "expired",
        )
        .unwrap();
        let err = bad_token.list_pages().await.unwrap_err();
        assert!(err.is_token_error());
        assert_eq!(err.status_code(), Some(400));
    }

    #[tokio::test]
    async fn media_list_is_capped_and_malformed_bodies_fail() {
        let base = spawn_graph(graph_router()).await;
        let client = client(base);
        let media = client.list_media("ig1", 2).await.unwrap();
        assert_eq!(media.len(), 2);
        let post = media[0].to_post(Uuid::new_v4(), Platform::Instagram).unwrap();
        assert_eq!(post.like_count, 7);
        assert_eq!(post.comment_count, 2);
        assert_eq!(media[1].to_post(Uuid::new_v4(), Platform::Instagram).unwrap().like_count, 0);

        let err = client.list_media("broken", 5).await.unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn graph_timestamps_accept_both_offset_forms() {
        let compact = parse_graph_timestamp("2026-03-01T08:00:00+0000").unwrap();
        let rfc = parse_graph_timestamp("2026-03-01T08:00:00Z").unwrap();
        assert_eq!(compact, rfc);
        assert!(parse_graph_timestamp("yesterday").is_none());
    }

    #[test]
    fn fingerprint_does_not_leak_token() {
        let fp = token_fingerprint("EAAB-secret-token");
        assert_eq!(fp.len(), 12);
        assert!(!fp.contains("secret"));
        assert_eq!(fp, token_fingerprint("EAAB-secret-token"));
    }
}
