//! Meta sync orchestration: configuration, run reports and the account walk.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use pulse_graph::{ApiError, GraphConfig, DEFAULT_GRAPH_BASE_URL};
use pulse_storage::StoreError;
use serde::Deserialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod orchestrator;
pub mod report;

pub use orchestrator::{Clock, SyncOrchestrator};
pub use report::{BatchSyncReport, SyncFailure, SyncReport, SyncScope, UserSyncOutcome};

pub const CRATE_NAME: &str = "pulse-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Api(ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        if err.is_token_error() {
            SyncError::Auth(err.to_string())
        } else {
            SyncError::Api(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub graph_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub lookback_days: u32,
    pub media_limit: usize,
    pub reporting_utc_offset_minutes: i32,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub cron_secret: Option<String>,
    pub web_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct SyncConfigOverride {
    database_url: Option<String>,
    graph_base_url: Option<String>,
    http_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    lookback_days: Option<u32>,
    media_limit: Option<usize>,
    reporting_utc_offset_minutes: Option<i32>,
    scheduler_enabled: Option<bool>,
    sync_cron: Option<String>,
    cron_secret: Option<String>,
    web_port: Option<u16>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_env("DATABASE_URL"),
            graph_base_url: std::env::var("PULSE_GRAPH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GRAPH_BASE_URL.to_string()),
            http_timeout_secs: env_parse("PULSE_HTTP_TIMEOUT_SECS", 20),
            user_agent: std::env::var("PULSE_USER_AGENT")
                .unwrap_or_else(|_| "pulse-sync/0.1".to_string()),
            lookback_days: env_parse("PULSE_LOOKBACK_DAYS", 90),
            media_limit: env_parse("PULSE_MEDIA_LIMIT", 30),
            reporting_utc_offset_minutes: env_parse("PULSE_REPORTING_UTC_OFFSET_MINUTES", 0),
            scheduler_enabled: std::env::var("PULSE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("PULSE_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            cron_secret: non_empty_env("CRON_SECRET"),
            web_port: env_parse("PULSE_WEB_PORT", 8000),
        }
    }

    /// Environment first, then any field present in the YAML file named by `PULSE_CONFIG`.
    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env();
        if let Ok(path) = std::env::var("PULSE_CONFIG") {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("read PULSE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        config.settings()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let overrides: SyncConfigOverride =
            serde_yaml::from_str(contents).context("parse pulse config yaml")?;
        if let Some(value) = overrides.database_url {
            self.database_url = Some(value);
        }
        if let Some(value) = overrides.graph_base_url {
            self.graph_base_url = value;
        }
        if let Some(value) = overrides.http_timeout_secs {
            self.http_timeout_secs = value;
        }
        if let Some(value) = overrides.user_agent {
            self.user_agent = value;
        }
        if let Some(value) = overrides.lookback_days {
            self.lookback_days = value;
        }
        if let Some(value) = overrides.media_limit {
            self.media_limit = value;
        }
        if let Some(value) = overrides.reporting_utc_offset_minutes {
            self.reporting_utc_offset_minutes = value;
        }
        if let Some(value) = overrides.scheduler_enabled {
            self.scheduler_enabled = value;
        }
        if let Some(value) = overrides.sync_cron {
            self.sync_cron = value;
        }
        if let Some(value) = overrides.cron_secret {
            self.cron_secret = Some(value);
        }
        if let Some(value) = overrides.web_port {
            self.web_port = value;
        }
        Ok(())
    }

    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            base_url: self.graph_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn settings(&self) -> Result<SyncSettings> {
        let reporting_offset = self
            .reporting_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .with_context(|| {
                format!(
                    "reporting UTC offset out of range: {} minutes",
                    self.reporting_utc_offset_minutes
                )
            })?;
        if self.media_limit == 0 {
            bail!("media limit must be at least 1");
        }
        Ok(SyncSettings {
            lookback_days: self.lookback_days,
            media_limit: self.media_limit,
            reporting_offset,
        })
    }
}

/// Per-run walk parameters handed to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub lookback_days: u32,
    pub media_limit: usize,
    /// Offset in which provider `end_time`s and "today" become calendar dates.
    pub reporting_offset: FixedOffset,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            media_limit: 30,
            reporting_offset: Utc.fix(),
        }
    }
}

/// Scheduler running the batch sync on `sync_cron`, or `None` when disabled.
pub async fn maybe_build_scheduler(
    orchestrator: Arc<SyncOrchestrator>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.sync_all_users().await {
                Ok(batch) => info!(synced = batch.synced, "scheduled meta sync finished"),
                Err(err) => warn!(error = %err, "scheduled meta sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SyncConfig {
        SyncConfig {
            database_url: None,
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            http_timeout_secs: 20,
            user_agent: "pulse-test".into(),
            lookback_days: 90,
            media_limit: 30,
            reporting_utc_offset_minutes: 0,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".into(),
            cron_secret: None,
            web_port: 8000,
        }
    }

    #[test]
    fn yaml_overrides_only_present_fields() {
        let mut config = base_config();
        config
            .apply_yaml("lookback_days: 7\nreporting_utc_offset_minutes: -480\ncron_secret: s3cret\n")
            .unwrap();
        assert_eq!(config.lookback_days, 7);
        assert_eq!(config.cron_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.media_limit, 30);

        let settings = config.settings().unwrap();
        assert_eq!(settings.reporting_offset.local_minus_utc(), -480 * 60);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = base_config();
        config.reporting_utc_offset_minutes = 24 * 60;
        assert!(config.settings().is_err());

        let mut config = base_config();
        config.reporting_utc_offset_minutes = 50_000_000;
        assert!(config.settings().is_err());

        let mut config = base_config();
        config.media_limit = 0;
        assert!(config.settings().is_err());

        assert!(base_config().apply_yaml("lookback_days: [1]").is_err());
    }

    #[test]
    fn token_errors_become_auth_failures() {
        let expired = ApiError::Status {
            status: 400,
            code: Some(190),
            message: "Session has expired".into(),
        };
        assert!(matches!(SyncError::from(expired), SyncError::Auth(_)));

        let throttled = ApiError::Status {
            status: 400,
            code: Some(4),
            message: "Application request limit reached".into(),
        };
        assert!(matches!(SyncError::from(throttled), SyncError::Api(_)));
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::new(pulse_storage::InMemoryStore::new()),
            Arc::new(pulse_graph::FixtureGraphConnector::new(Default::default())),
            SyncSettings::default(),
        ));
        assert!(maybe_build_scheduler(orchestrator, &base_config())
            .await
            .unwrap()
            .is_none());
    }
}
