use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    ConnectedAccount,
    Page,
    LinkedAccount,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub scope: SyncScope,
    /// Id of the failed item (grant uuid, page id, account id or media id).
    pub reference: String,
    pub error: String,
}

/// Outcome of one user's sync run.
///
/// `success` is false only when the user had no connected accounts; everything else
/// that went wrong is listed in `failures`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub success: bool,
    pub message: String,
    pub accounts_processed: usize,
    pub pages_processed: usize,
    pub linked_accounts_processed: usize,
    pub posts_processed: usize,
    pub daily_metric_rows: usize,
    pub post_metric_rows: usize,
    pub failures: Vec<SyncFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn is_partial(&self) -> bool {
        self.success && !self.failures.is_empty()
    }

    pub fn failures_in(&self, scope: SyncScope) -> impl Iterator<Item = &SyncFailure> {
        self.failures.iter().filter(move |f| f.scope == scope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncOutcome {
    pub user_id: Uuid,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<SyncReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSyncReport {
    pub success: bool,
    pub synced: usize,
    pub results: Vec<UserSyncOutcome>,
}
