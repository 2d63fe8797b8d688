//! Postgres implementation of [`MetricsStore`].
//!
//! Upserts are single `INSERT .. ON CONFLICT .. DO UPDATE` statements, so Postgres
//! serializes same-key writers at the row lock. Metric columns are merged with
//! `COALESCE(EXCLUDED.col, table.col)`: a `NULL` in the incoming row means "not part of
//! this write" and keeps the stored value.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{
    ConnectedAccount, DailyMetricRow, DailyMetrics, LinkedAccount, PageAccount, Platform, Post,
    PostMetricRow, PostMetrics,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{
    DailyMetricQuery, MetricsStore, PostPage, PostQuery, SortOrder, StoreError, StoreResult,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema under `migrations/`.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Unexpected(anyhow!("running migrations: {err}")))?;
        info!("database migrations applied");
        Ok(())
    }
}

fn platform_from_row(row: &PgRow) -> StoreResult<Platform> {
    let raw: String = row.try_get("platform")?;
    Platform::parse(&raw).ok_or_else(|| StoreError::Unexpected(anyhow!("unknown platform {raw:?}")))
}

fn connected_account_from_row(row: &PgRow) -> StoreResult<ConnectedAccount> {
    Ok(ConnectedAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        token: row.try_get("token")?,
        token_expires_at: row.try_get("token_expires_at")?,
        scopes: row.try_get("scopes")?,
        invalidated_at: row.try_get("invalidated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn daily_metric_from_row(row: &PgRow) -> StoreResult<DailyMetricRow> {
    Ok(DailyMetricRow {
        user_id: row.try_get("user_id")?,
        account_ref: row.try_get("account_ref")?,
        platform: platform_from_row(row)?,
        date: row.try_get("date")?,
        metrics: DailyMetrics {
            impressions: row.try_get("impressions")?,
            reach: row.try_get("reach")?,
            engagements: row.try_get("engagements")?,
            profile_views: row.try_get("profile_views")?,
            follower_count: row.try_get("follower_count")?,
            link_clicks: row.try_get("link_clicks")?,
            video_views: row.try_get("video_views")?,
        },
    })
}

fn post_from_row(row: &PgRow) -> StoreResult<Post> {
    Ok(Post {
        user_id: row.try_get("user_id")?,
        platform: platform_from_row(row)?,
        post_id: row.try_get("post_id")?,
        created_time: row.try_get("created_time")?,
        caption: row.try_get("caption")?,
        media_type: row.try_get("media_type")?,
        permalink: row.try_get("permalink")?,
        like_count: row.try_get("like_count")?,
        comment_count: row.try_get("comment_count")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
    })
}

fn post_metric_from_row(row: &PgRow) -> StoreResult<PostMetricRow> {
    Ok(PostMetricRow {
        user_id: row.try_get("user_id")?,
        platform: platform_from_row(row)?,
        post_id: row.try_get("post_id")?,
        date: row.try_get("date")?,
        metrics: PostMetrics {
            impressions: row.try_get("impressions")?,
            reach: row.try_get("reach")?,
            engagement: row.try_get("engagement")?,
            saved: row.try_get("saved")?,
            video_views: row.try_get("video_views")?,
        },
    })
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn connected_accounts(
        &self,
        user_id: Uuid,
        provider: &str,
        account_id: Option<Uuid>,
    ) -> StoreResult<Vec<ConnectedAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, provider, token, token_expires_at, scopes, invalidated_at, created_at
              FROM connected_accounts
             WHERE user_id = $1
               AND provider = $2
               AND ($3::uuid IS NULL OR id = $3)
             ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(connected_account_from_row).collect()
    }

    async fn users_with_provider(&self, provider: &str) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT user_id
              FROM connected_accounts
             WHERE provider = $1
             ORDER BY user_id
            "#,
        )
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("user_id")?);
        }
        Ok(out)
    }

    async fn upsert_connected_account(&self, account: &ConnectedAccount) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO connected_accounts
                (id, user_id, provider, token, token_expires_at, scopes, invalidated_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                token = EXCLUDED.token,
                token_expires_at = EXCLUDED.token_expires_at,
                scopes = EXCLUDED.scopes,
                invalidated_at = EXCLUDED.invalidated_at
            "#,
        )
        .bind(account.id)
        .bind(account.user_id)
        .bind(&account.provider)
        .bind(&account.token)
        .bind(account.token_expires_at)
        .bind(&account.scopes)
        .bind(account.invalidated_at)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate_connected_account(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE connected_accounts SET invalidated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("connected account {id}")));
        }
        Ok(())
    }

    async fn upsert_page(&self, page: &PageAccount) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pages (user_id, page_id, name, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id, page_id) DO UPDATE SET
                name = EXCLUDED.name,
                updated_at = NOW()
            "#,
        )
        .bind(page.user_id)
        .bind(&page.page_id)
        .bind(&page.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_linked_account(&self, account: &LinkedAccount) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO linked_accounts (user_id, account_id, username, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id, account_id) DO UPDATE SET
                username = EXCLUDED.username,
                updated_at = NOW()
            "#,
        )
        .bind(account.user_id)
        .bind(&account.account_id)
        .bind(&account.username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_daily_metrics(&self, row: &DailyMetricRow) -> StoreResult<()> {
        let m = &row.metrics;
        sqlx::query(
            r#"
            INSERT INTO daily_metrics
                (user_id, account_ref, platform, date, impressions, reach, engagements,
                 profile_views, follower_count, link_clicks, video_views, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (user_id, account_ref, platform, date) DO UPDATE SET
                impressions = COALESCE(EXCLUDED.impressions, daily_metrics.impressions),
                reach = COALESCE(EXCLUDED.reach, daily_metrics.reach),
                engagements = COALESCE(EXCLUDED.engagements, daily_metrics.engagements),
                profile_views = COALESCE(EXCLUDED.profile_views, daily_metrics.profile_views),
                follower_count = COALESCE(EXCLUDED.follower_count, daily_metrics.follower_count),
                link_clicks = COALESCE(EXCLUDED.link_clicks, daily_metrics.link_clicks),
                video_views = COALESCE(EXCLUDED.video_views, daily_metrics.video_views),
                updated_at = NOW()
            "#,
        )
        .bind(row.user_id)
        .bind(&row.account_ref)
        .bind(row.platform.as_str())
        .bind(row.date)
        .bind(m.impressions)
        .bind(m.reach)
        .bind(m.engagements)
        .bind(m.profile_views)
        .bind(m.follower_count)
        .bind(m.link_clicks)
        .bind(m.video_views)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_post(&self, post: &Post) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO posts
                (user_id, platform, post_id, created_time, caption, media_type, permalink,
                 like_count, comment_count, thumbnail_url, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (user_id, platform, post_id) DO UPDATE SET
                created_time = EXCLUDED.created_time,
                caption = EXCLUDED.caption,
                media_type = EXCLUDED.media_type,
                permalink = EXCLUDED.permalink,
                like_count = EXCLUDED.like_count,
                comment_count = EXCLUDED.comment_count,
                thumbnail_url = EXCLUDED.thumbnail_url,
                updated_at = NOW()
            "#,
        )
        .bind(post.user_id)
        .bind(post.platform.as_str())
        .bind(&post.post_id)
        .bind(post.created_time)
        .bind(&post.caption)
        .bind(&post.media_type)
        .bind(&post.permalink)
        .bind(post.like_count)
        .bind(post.comment_count)
        .bind(&post.thumbnail_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_post_metrics(&self, row: &PostMetricRow) -> StoreResult<()> {
        let m = &row.metrics;
        sqlx::query(
            r#"
            INSERT INTO post_metrics_daily
                (user_id, platform, post_id, date, impressions, reach, engagement, saved,
                 video_views, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (user_id, platform, post_id, date) DO UPDATE SET
                impressions = COALESCE(EXCLUDED.impressions, post_metrics_daily.impressions),
                reach = COALESCE(EXCLUDED.reach, post_metrics_daily.reach),
                engagement = COALESCE(EXCLUDED.engagement, post_metrics_daily.engagement),
                saved = COALESCE(EXCLUDED.saved, post_metrics_daily.saved),
                video_views = COALESCE(EXCLUDED.video_views, post_metrics_daily.video_views),
                updated_at = NOW()
            "#,
        )
        .bind(row.user_id)
        .bind(row.platform.as_str())
        .bind(&row.post_id)
        .bind(row.date)
        .bind(m.impressions)
        .bind(m.reach)
        .bind(m.engagement)
        .bind(m.saved)
        .bind(m.video_views)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pages(&self, user_id: Uuid) -> StoreResult<Vec<PageAccount>> {
        let rows = sqlx::query(
            "SELECT user_id, page_id, name FROM pages WHERE user_id = $1 ORDER BY page_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PageAccount {
                user_id: row.try_get("user_id")?,
                page_id: row.try_get("page_id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn linked_accounts(&self, user_id: Uuid) -> StoreResult<Vec<LinkedAccount>> {
        let rows = sqlx::query(
            "SELECT user_id, account_id, username FROM linked_accounts WHERE user_id = $1 ORDER BY account_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LinkedAccount {
                user_id: row.try_get("user_id")?,
                account_id: row.try_get("account_id")?,
                username: row.try_get("username")?,
            });
        }
        Ok(out)
    }

    async fn daily_metrics(&self, query: &DailyMetricQuery) -> StoreResult<Vec<DailyMetricRow>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, account_ref, platform, date, impressions, reach, engagements,
                   profile_views, follower_count, link_clicks, video_views
              FROM daily_metrics
             WHERE user_id = $1
               AND date >= $2
               AND date <= $3
               AND ($4::text IS NULL OR account_ref = $4)
               AND ($5::text IS NULL OR platform = $5)
             ORDER BY date ASC, account_ref ASC, platform ASC
            "#,
        )
        .bind(query.user_id)
        .bind(query.from)
        .bind(query.to)
        .bind(query.account_ref.as_deref())
        .bind(query.platform.map(|p| p.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(daily_metric_from_row).collect()
    }

    async fn posts(&self, query: &PostQuery) -> StoreResult<PostPage> {
        let direction = match query.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        // Column and direction come from closed enums, never from request text.
        let sql = format!(
            r#"
            SELECT user_id, platform, post_id, created_time, caption, media_type, permalink,
                   like_count, comment_count, thumbnail_url
              FROM posts
             WHERE user_id = $1
               AND ($2::text IS NULL OR platform = $2)
             ORDER BY {column} {direction}, post_id {direction}
             LIMIT $3 OFFSET $4
            "#,
            column = query.sort_by.column(),
        );
        let rows = sqlx::query(&sql)
            .bind(query.user_id)
            .bind(query.platform.map(|p| p.as_str()))
            .bind(query.limit.max(0))
            .bind(query.offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        let posts = rows.iter().map(post_from_row).collect::<StoreResult<Vec<_>>>()?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM posts
             WHERE user_id = $1
               AND ($2::text IS NULL OR platform = $2)
            "#,
        )
        .bind(query.user_id)
        .bind(query.platform.map(|p| p.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(PostPage { posts, total })
    }

    async fn latest_post_metrics(
        &self,
        user_id: Uuid,
        platform: Platform,
        post_id: &str,
    ) -> StoreResult<Option<PostMetricRow>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, platform, post_id, date, impressions, reach, engagement, saved, video_views
              FROM post_metrics_daily
             WHERE user_id = $1
               AND platform = $2
               AND post_id = $3
             ORDER BY date DESC
             LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(platform.as_str())
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(post_metric_from_row).transpose()
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
