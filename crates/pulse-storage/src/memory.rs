//! In-memory implementation of [`MetricsStore`].
//!
//! Used by tests, fixture runs and as the fallback when no `DATABASE_URL` is configured.
//! Each table is a `HashMap` behind its own `tokio::sync::RwLock`; an upsert holds the
//! write lock for the whole read-merge-write, so concurrent writers to one key always
//! leave one writer's complete values behind. State is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{
    ConnectedAccount, DailyMetricKey, DailyMetricRow, LinkedAccount, PageAccount, Platform, Post,
    PostKey, PostMetricKey, PostMetricRow,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    DailyMetricQuery, MetricsStore, PostPage, PostQuery, PostSortField, SortOrder, StoreError,
    StoreResult,
};

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    connected: Arc<RwLock<HashMap<Uuid, ConnectedAccount>>>,
    pages: Arc<RwLock<HashMap<(Uuid, String), PageAccount>>>,
    linked: Arc<RwLock<HashMap<(Uuid, String), LinkedAccount>>>,
    daily: Arc<RwLock<HashMap<DailyMetricKey, DailyMetricRow>>>,
    posts: Arc<RwLock<HashMap<PostKey, Post>>>,
    post_metrics: Arc<RwLock<HashMap<PostMetricKey, PostMetricRow>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across the synced tables (grants excluded).
    pub async fn synced_row_count(&self) -> usize {
        self.pages.read().await.len()
            + self.linked.read().await.len()
            + self.daily.read().await.len()
            + self.posts.read().await.len()
            + self.post_metrics.read().await.len()
    }

    pub async fn post_metric_rows(&self, user_id: Uuid) -> Vec<PostMetricRow> {
        let mut rows = self
            .post_metrics
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }
}

#[async_trait]
impl MetricsStore for InMemoryStore {
    async fn connected_accounts(
        &self,
        user_id: Uuid,
        provider: &str,
        account_id: Option<Uuid>,
    ) -> StoreResult<Vec<ConnectedAccount>> {
        let mut out = self
            .connected
            .read()
            .await
            .values()
            .filter(|a| a.user_id == user_id && a.provider == provider)
            .filter(|a| account_id.is_none_or(|id| a.id == id))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|a| (a.created_at, a.id));
        Ok(out)
    }

    async fn users_with_provider(&self, provider: &str) -> StoreResult<Vec<Uuid>> {
        let mut users = self
            .connected
            .read()
            .await
            .values()
            .filter(|a| a.provider == provider)
            .map(|a| a.user_id)
            .collect::<Vec<_>>();
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn upsert_connected_account(&self, account: &ConnectedAccount) -> StoreResult<()> {
        self.connected
            .write()
            .await
            .insert(account.id, account.clone());
        Ok(())
    }

    async fn invalidate_connected_account(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut connected = self.connected.write().await;
        let account = connected
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("connected account {id}")))?;
        account.invalidated_at = Some(at);
        Ok(())
    }

    async fn upsert_page(&self, page: &PageAccount) -> StoreResult<()> {
        self.pages
            .write()
            .await
            .insert((page.user_id, page.page_id.clone()), page.clone());
        Ok(())
    }

    async fn upsert_linked_account(&self, account: &LinkedAccount) -> StoreResult<()> {
        self.linked
            .write()
            .await
            .insert((account.user_id, account.account_id.clone()), account.clone());
        Ok(())
    }

    async fn upsert_daily_metrics(&self, row: &DailyMetricRow) -> StoreResult<()> {
        let mut daily = self.daily.write().await;
        daily
            .entry(row.key())
            .and_modify(|stored| stored.metrics.merge(&row.metrics))
            .or_insert_with(|| row.clone());
        Ok(())
    }

    async fn upsert_post(&self, post: &Post) -> StoreResult<()> {
        self.posts.write().await.insert(post.key(), post.clone());
        Ok(())
    }

    async fn upsert_post_metrics(&self, row: &PostMetricRow) -> StoreResult<()> {
        let mut post_metrics = self.post_metrics.write().await;
        post_metrics
            .entry(row.key())
            .and_modify(|stored| stored.metrics.merge(&row.metrics))
            .or_insert_with(|| row.clone());
        Ok(())
    }

    async fn pages(&self, user_id: Uuid) -> StoreResult<Vec<PageAccount>> {
        let mut out = self
            .pages
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.page_id.cmp(&b.page_id));
        Ok(out)
    }

    async fn linked_accounts(&self, user_id: Uuid) -> StoreResult<Vec<LinkedAccount>> {
        let mut out = self
            .linked
            .read()
            .await
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(out)
    }

    async fn daily_metrics(&self, query: &DailyMetricQuery) -> StoreResult<Vec<DailyMetricRow>> {
        let mut out = self
            .daily
            .read()
            .await
            .values()
            .filter(|r| r.user_id == query.user_id && r.date >= query.from && r.date <= query.to)
            .filter(|r| query.account_ref.as_ref().is_none_or(|a| &r.account_ref == a))
            .filter(|r| query.platform.is_none_or(|p| r.platform == p))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            (a.date, &a.account_ref, a.platform).cmp(&(b.date, &b.account_ref, b.platform))
        });
        Ok(out)
    }

    async fn posts(&self, query: &PostQuery) -> StoreResult<PostPage> {
        let mut matching = self
            .posts
            .read()
            .await
            .values()
            .filter(|p| p.user_id == query.user_id)
            .filter(|p| query.platform.is_none_or(|platform| p.platform == platform))
            .cloned()
            .collect::<Vec<_>>();

        matching.sort_by(|a, b| {
            let ordering = match query.sort_by {
                PostSortField::CreatedTime => a.created_time.cmp(&b.created_time),
                PostSortField::LikeCount => a.like_count.cmp(&b.like_count),
                PostSortField::CommentCount => a.comment_count.cmp(&b.comment_count),
            }
            .then_with(|| a.post_id.cmp(&b.post_id));
            match query.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matching.len() as i64;
        let posts = matching
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect();
        Ok(PostPage { posts, total })
    }

    async fn latest_post_metrics(
        &self,
        user_id: Uuid,
        platform: Platform,
        post_id: &str,
    ) -> StoreResult<Option<PostMetricRow>> {
        Ok(self
            .post_metrics
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id && r.platform == platform && r.post_id == post_id)
            .max_by_key(|r| r.date)
            .cloned())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
