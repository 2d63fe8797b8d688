//! Idempotent persistence gateway for synced Meta data.
//!
//! Every write is an upsert keyed by the row's composite identity. Metric tables merge
//! column-wise (columns absent from the incoming row keep their stored value); the post
//! table replaces the whole row. Each upsert is atomic per row in both backends.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pulse_core::{
    ConnectedAccount, DailyMetricRow, LinkedAccount, PageAccount, Platform, Post, PostMetricRow,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "pulse-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Date-bounded (inclusive) selection over `daily_metrics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyMetricQuery {
    pub user_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub account_ref: Option<String>,
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostSortField {
    #[default]
    CreatedTime,
    LikeCount,
    CommentCount,
}

impl PostSortField {
    pub fn column(&self) -> &'static str {
        match self {
            PostSortField::CreatedTime => "created_time",
            PostSortField::LikeCount => "like_count",
            PostSortField::CommentCount => "comment_count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostQuery {
    pub user_id: Uuid,
    pub platform: Option<Platform>,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: PostSortField,
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub total: i64,
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn connected_accounts(
        &self,
        user_id: Uuid,
        provider: &str,
        account_id: Option<Uuid>,
    ) -> StoreResult<Vec<ConnectedAccount>>;
    /// Distinct owners of at least one grant for `provider`.
    async fn users_with_provider(&self, provider: &str) -> StoreResult<Vec<Uuid>>;
    async fn upsert_connected_account(&self, account: &ConnectedAccount) -> StoreResult<()>;
    async fn invalidate_connected_account(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    async fn upsert_page(&self, page: &PageAccount) -> StoreResult<()>;
    async fn upsert_linked_account(&self, account: &LinkedAccount) -> StoreResult<()>;
    async fn upsert_daily_metrics(&self, row: &DailyMetricRow) -> StoreResult<()>;
    async fn upsert_post(&self, post: &Post) -> StoreResult<()>;
    async fn upsert_post_metrics(&self, row: &PostMetricRow) -> StoreResult<()>;

    async fn pages(&self, user_id: Uuid) -> StoreResult<Vec<PageAccount>>;
    async fn linked_accounts(&self, user_id: Uuid) -> StoreResult<Vec<LinkedAccount>>;
    /// Rows ordered by date ascending.
    async fn daily_metrics(&self, query: &DailyMetricQuery) -> StoreResult<Vec<DailyMetricRow>>;
    async fn posts(&self, query: &PostQuery) -> StoreResult<PostPage>;
    async fn latest_post_metrics(
        &self,
        user_id: Uuid,
        platform: Platform,
        post_id: &str,
    ) -> StoreResult<Option<PostMetricRow>>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}
