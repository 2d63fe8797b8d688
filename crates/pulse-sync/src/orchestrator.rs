//! Walks a user's Meta graph and writes normalized rows.
//!
//! The walk is sequential: grant, pages, linked account, media. A failure at any node is
//! recorded in the run report and the walk moves on to the node's siblings.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use pulse_core::{
    lifetime_snapshot, normalize_insights, reporting_date, ConnectedAccount, DailyMetricRow,
    DailyMetrics, Platform, PostMetricRow, PostMetrics, ACCOUNT_INSIGHT_METRICS,
    MEDIA_INSIGHT_METRICS, META_PROVIDER, PAGE_INSIGHT_METRICS,
};
use pulse_graph::{
    token_fingerprint, GraphApi, GraphConnector, GraphLinkedAccount, GraphMedia, GraphPage,
};
use pulse_storage::MetricsStore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::{BatchSyncReport, SyncFailure, SyncReport, SyncScope, UserSyncOutcome};
use crate::{SyncError, SyncSettings};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const NO_ACCOUNTS_MESSAGE: &str = "no connected Meta accounts";

/// Inclusive date window requested from the insights endpoints.
#[derive(Debug, Clone, Copy)]
struct Window {
    today: NaiveDate,
    since: NaiveDate,
}

impl Window {
    fn since_param(&self) -> String {
        self.since.format("%Y-%m-%d").to_string()
    }

    fn until_param(&self) -> String {
        self.today.format("%Y-%m-%d").to_string()
    }
}

/// Counters and failures accumulated over one run.
#[derive(Debug, Default)]
struct RunLedger {
    accounts_processed: usize,
    pages_processed: usize,
    linked_accounts_processed: usize,
    posts_processed: usize,
    daily_metric_rows: usize,
    post_metric_rows: usize,
    failures: Vec<SyncFailure>,
}

impl RunLedger {
    fn record(&mut self, scope: SyncScope, reference: &str, err: SyncError) {
        warn!(?scope, reference, error = %err, "meta sync step failed");
        self.failures.push(SyncFailure {
            scope,
            reference: reference.to_string(),
            error: err.to_string(),
        });
    }

    async fn attempt<T, E>(
        &mut self,
        scope: SyncScope,
        reference: &str,
        step: impl Future<Output = Result<T, E>>,
    ) -> Option<T>
    where
        E: Into<SyncError>,
    {
        match step.await {
            Ok(value) => Some(value),
            Err(err) => {
                self.record(scope, reference, err.into());
                None
            }
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn MetricsStore>,
    graph: Arc<dyn GraphConnector>,
    settings: SyncSettings,
    clock: Clock,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        graph: Arc<dyn GraphConnector>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            graph,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Syncs every Meta grant of `user_id`, or only `account_id` when given.
    ///
    /// Only a failure to load the grants is returned as `Err`.
    pub async fn sync(
        &self,
        user_id: Uuid,
        account_id: Option<Uuid>,
    ) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("meta_sync", %run_id, %user_id);
        self.sync_inner(run_id, user_id, account_id).instrument(span).await
    }

    async fn sync_inner(
        &self,
        run_id: Uuid,
        user_id: Uuid,
        account_id: Option<Uuid>,
    ) -> Result<SyncReport, SyncError> {
        let started_at = (self.clock)();
        let accounts = self
            .store
            .connected_accounts(user_id, META_PROVIDER, account_id)
            .await?;

        if accounts.is_empty() {
            info!("no connected meta accounts; nothing to sync");
            return Ok(SyncReport {
                run_id,
                user_id,
                success: false,
                message: NO_ACCOUNTS_MESSAGE.to_string(),
                accounts_processed: 0,
                pages_processed: 0,
                linked_accounts_processed: 0,
                posts_processed: 0,
                daily_metric_rows: 0,
                post_metric_rows: 0,
                failures: Vec::new(),
                started_at,
                finished_at: (self.clock)(),
            });
        }

        let today = reporting_date(started_at, self.settings.reporting_offset);
        let window = Window {
            today,
            since: today - Duration::days(i64::from(self.settings.lookback_days)),
        };
        let mut ledger = RunLedger::default();

        for account in &accounts {
            self.sync_account(user_id, account, started_at, window, &mut ledger).await;
        }

        let finished_at = (self.clock)();
        let message = format!(
            "synced {} pages, {} linked accounts and {} posts",
            ledger.pages_processed, ledger.linked_accounts_processed, ledger.posts_processed
        );
        info!(
            accounts = ledger.accounts_processed,
            pages = ledger.pages_processed,
            linked_accounts = ledger.linked_accounts_processed,
            posts = ledger.posts_processed,
            daily_rows = ledger.daily_metric_rows,
            failures = ledger.failures.len(),
            "meta sync finished"
        );

        Ok(SyncReport {
            run_id,
            user_id,
            success: true,
            message,
            accounts_processed: ledger.accounts_processed,
            pages_processed: ledger.pages_processed,
            linked_accounts_processed: ledger.linked_accounts_processed,
            posts_processed: ledger.posts_processed,
            daily_metric_rows: ledger.daily_metric_rows,
            post_metric_rows: ledger.post_metric_rows,
            failures: ledger.failures,
            started_at,
            finished_at,
        })
    }

    async fn sync_account(
        &self,
        user_id: Uuid,
        account: &ConnectedAccount,
        now: DateTime<Utc>,
        window: Window,
        ledger: &mut RunLedger,
    ) {
        let reference = account.id.to_string();
        if account.invalidated_at.is_some() {
            ledger.record(
                SyncScope::ConnectedAccount,
                &reference,
                SyncError::Auth("grant was invalidated".to_string()),
            );
            return;
        }
        if account.is_expired(now) {
            ledger.record(
                SyncScope::ConnectedAccount,
                &reference,
                SyncError::Auth("access token expired".to_string()),
            );
            self.invalidate(account, now).await;
            return;
        }
        let Some(access_token) = account.access_token() else {
            ledger.record(
                SyncScope::ConnectedAccount,
                &reference,
                SyncError::Auth("stored token has no access_token".to_string()),
            );
            return;
        };

        debug!(
            account = %reference,
            token = %token_fingerprint(access_token),
            "syncing connected account"
        );
        let graph = self.graph.connect(access_token);
        let pages = match graph.list_pages().await.map_err(SyncError::from) {
            Ok(pages) => pages,
            Err(err) => {
                let is_auth = matches!(err, SyncError::Auth(_));
                ledger.record(SyncScope::ConnectedAccount, &reference, err);
                if is_auth {
                    self.invalidate(account, now).await;
                }
                return;
            }
        };
        ledger.accounts_processed += 1;

        for page in &pages {
            self.sync_page(graph.as_ref(), user_id, page, window, ledger).await;
        }
    }

    async fn invalidate(&self, account: &ConnectedAccount, at: DateTime<Utc>) {
        if let Err(err) = self.store.invalidate_connected_account(account.id, at).await {
            warn!(account = %account.id, error = %err, "failed to invalidate connected account");
        }
    }

    async fn sync_page(
        &self,
        graph: &dyn GraphApi,
        user_id: Uuid,
        page: &GraphPage,
        window: Window,
        ledger: &mut RunLedger,
    ) {
        let page_account = page.to_page_account(user_id);
        let mut complete = ledger
            .attempt(SyncScope::Page, &page.id, self.store.upsert_page(&page_account))
            .await
            .is_some();

        match ledger
            .attempt(SyncScope::Page, &page.id, graph.linked_account(&page.id))
            .await
        {
            Some(Some(linked)) => {
                self.sync_linked_account(graph, user_id, &linked, window, ledger)
                    .await
            }
            Some(None) => debug!(page = %page.id, "page has no linked business account"),
            None => complete = false,
        }

        match ledger
            .attempt(
                SyncScope::Page,
                &page.id,
                self.sync_daily_insights(
                    graph,
                    user_id,
                    &page.id,
                    Platform::Facebook,
                    PAGE_INSIGHT_METRICS,
                    window,
                ),
            )
            .await
        {
            Some(rows) => ledger.daily_metric_rows += rows,
            None => complete = false,
        }

        if complete {
            ledger.pages_processed += 1;
        }
    }

    async fn sync_linked_account(
        &self,
        graph: &dyn GraphApi,
        user_id: Uuid,
        linked: &GraphLinkedAccount,
        window: Window,
        ledger: &mut RunLedger,
    ) {
        let account = linked.to_linked_account(user_id);
        let mut complete = ledger
            .attempt(
                SyncScope::LinkedAccount,
                &linked.id,
                self.store.upsert_linked_account(&account),
            )
            .await
            .is_some();

        match ledger
            .attempt(
                SyncScope::LinkedAccount,
                &linked.id,
                self.sync_daily_insights(
                    graph,
                    user_id,
                    &linked.id,
                    Platform::Instagram,
                    ACCOUNT_INSIGHT_METRICS,
                    window,
                ),
            )
            .await
        {
            Some(rows) => ledger.daily_metric_rows += rows,
            None => complete = false,
        }

        let media = match ledger
            .attempt(
                SyncScope::LinkedAccount,
                &linked.id,
                graph.list_media(&linked.id, self.settings.media_limit),
            )
            .await
        {
            Some(media) => media,
            None => {
                complete = false;
                Vec::new()
            }
        };

        if complete {
            ledger.linked_accounts_processed += 1;
        }

        for item in &media {
            self.sync_post(graph, user_id, item, window.today, ledger).await;
        }
    }

    async fn sync_post(
        &self,
        graph: &dyn GraphApi,
        user_id: Uuid,
        item: &GraphMedia,
        today: NaiveDate,
        ledger: &mut RunLedger,
    ) {
        let post = match item.to_post(user_id, Platform::Instagram) {
            Ok(post) => post,
            Err(err) => {
                ledger.record(SyncScope::Post, &item.id, err.into());
                return;
            }
        };
        if ledger
            .attempt(SyncScope::Post, &item.id, self.store.upsert_post(&post))
            .await
            .is_none()
        {
            return;
        }

        let Some(insights) = ledger
            .attempt(
                SyncScope::Post,
                &item.id,
                graph.media_insights(&item.id, &metric_names(MEDIA_INSIGHT_METRICS)),
            )
            .await
        else {
            return;
        };

        let metrics = PostMetrics::from_values(&lifetime_snapshot(&insights));
        if !metrics.is_empty() {
            let row = PostMetricRow {
                user_id,
                platform: Platform::Instagram,
                post_id: item.id.clone(),
                date: today,
                metrics,
            };
            if ledger
                .attempt(SyncScope::Post, &item.id, self.store.upsert_post_metrics(&row))
                .await
                .is_none()
            {
                return;
            }
            ledger.post_metric_rows += 1;
        }
        ledger.posts_processed += 1;
    }

    /// Fetches daily insights for one account and upserts one row per reported date.
    async fn sync_daily_insights(
        &self,
        graph: &dyn GraphApi,
        user_id: Uuid,
        account_ref: &str,
        platform: Platform,
        metrics: &[&str],
        window: Window,
    ) -> Result<usize, SyncError> {
        let insights = graph
            .account_insights(
                account_ref,
                &metric_names(metrics),
                &window.since_param(),
                &window.until_param(),
            )
            .await?;

        let mut written = 0;
        for (date, values) in normalize_insights(&insights, self.settings.reporting_offset) {
            let metrics = DailyMetrics::from_values(&values);
            if metrics.is_empty() {
                continue;
            }
            let row = DailyMetricRow {
                user_id,
                account_ref: account_ref.to_string(),
                platform,
                date,
                metrics,
            };
            self.store.upsert_daily_metrics(&row).await?;
            written += 1;
        }
        debug!(account_ref, %platform, rows = written, "daily insights stored");
        Ok(written)
    }

    /// One sync per user holding a Meta grant. A failed user never stops the batch.
    pub async fn sync_all_users(&self) -> Result<BatchSyncReport, SyncError> {
        let users = self.store.users_with_provider(META_PROVIDER).await?;
        info!(users = users.len(), "starting batch meta sync");

        let mut results = Vec::with_capacity(users.len());
        for user_id in users {
            let outcome = match self.sync(user_id, None).await {
                Ok(report) => UserSyncOutcome {
                    user_id,
                    success: report.success,
                    message: report.message.clone(),
                    report: Some(report),
                },
                Err(err) => {
                    warn!(%user_id, error = %err, "meta sync failed for user");
                    UserSyncOutcome {
                        user_id,
                        success: false,
                        message: err.to_string(),
                        report: None,
                    }
                }
            };
            results.push(outcome);
        }

        Ok(BatchSyncReport {
            success: true,
            synced: results.len(),
            results,
        })
    }
}

fn metric_names(metrics: &[&str]) -> Vec<String> {
    metrics.iter().map(|m| m.to_string()).collect()
}
