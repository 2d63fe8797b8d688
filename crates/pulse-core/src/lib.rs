//! Core domain model, typed metric sets and insight normalization for Pulse.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-core";

/// Provider tag stored on connected accounts created by the Meta OAuth flow.
pub const META_PROVIDER: &str = "meta";

pub const ACCOUNT_INSIGHT_METRICS: &[&str] = &["impressions", "reach", "profile_views", "follower_count"];
pub const PAGE_INSIGHT_METRICS: &[&str] = &["page_impressions", "page_reach", "page_engaged_users"];
pub const MEDIA_INSIGHT_METRICS: &[&str] = &["impressions", "reach", "engagement", "saved", "video_views"];

pub const DEFAULT_META_SCOPES: &[&str] = &[
    "pages_read_engagement",
    "pages_read_user_content",
    "pages_show_list",
    "instagram_basic",
    "instagram_manage_insights",
    "business_management",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "facebook" => Some(Platform::Facebook),
            "instagram" => Some(Platform::Instagram),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored external authentication grant.
///
/// `token` is kept as the raw JSON object written by the OAuth callback so that a
/// malformed grant can be detected (and skipped) at sync time instead of failing to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub token: serde_json::Value,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConnectedAccount {
    pub fn new(
        user_id: Uuid,
        provider: impl Into<String>,
        access_token: &str,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider: provider.into(),
            token: serde_json::json!({
                "access_token": access_token,
                "token_type": "bearer",
            }),
            token_expires_at,
            scopes: DEFAULT_META_SCOPES.iter().map(|s| s.to_string()).collect(),
            invalidated_at: None,
            created_at: Utc::now(),
        }
    }

    /// Access token string, or `None` when the stored token is absent or malformed.
    pub fn access_token(&self) -> Option<&str> {
        self.token
            .get("access_token")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.token_expires_at, Some(expires_at) if expires_at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAccount {
    pub user_id: Uuid,
    pub page_id: String,
    pub name: Option<String>,
}

/// Business profile (Instagram) attached to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub user_id: Uuid,
    pub account_id: String,
    pub username: Option<String>,
}

/// Named metric values for one date, as pivoted out of provider insights.
pub type MetricValues = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyMetric {
    Impressions,
    Reach,
    Engagements,
    ProfileViews,
    FollowerCount,
    LinkClicks,
    VideoViews,
}

impl DailyMetric {
    pub const ALL: [DailyMetric; 7] = [
        DailyMetric::Impressions,
        DailyMetric::Reach,
        DailyMetric::Engagements,
        DailyMetric::ProfileViews,
        DailyMetric::FollowerCount,
        DailyMetric::LinkClicks,
        DailyMetric::VideoViews,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            DailyMetric::Impressions => "impressions",
            DailyMetric::Reach => "reach",
            DailyMetric::Engagements => "engagements",
            DailyMetric::ProfileViews => "profile_views",
            DailyMetric::FollowerCount => "follower_count",
            DailyMetric::LinkClicks => "link_clicks",
            DailyMetric::VideoViews => "video_views",
        }
    }

    /// Maps a provider insight name (account or page level) onto its column.
    pub fn from_provider_name(name: &str) -> Option<Self> {
        match name {
            "impressions" | "page_impressions" => Some(DailyMetric::Impressions),
            "reach" | "page_reach" => Some(DailyMetric::Reach),
            "engagements" | "page_engaged_users" | "accounts_engaged" => Some(DailyMetric::Engagements),
            "profile_views" => Some(DailyMetric::ProfileViews),
            "follower_count" | "page_fans" => Some(DailyMetric::FollowerCount),
            "link_clicks" | "website_clicks" => Some(DailyMetric::LinkClicks),
            "video_views" | "page_video_views" => Some(DailyMetric::VideoViews),
            _ => None,
        }
    }
}

/// Sparse per-day account metrics. `None` means "not part of this write".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub impressions: Option<i64>,
    pub reach: Option<i64>,
    pub engagements: Option<i64>,
    pub profile_views: Option<i64>,
    pub follower_count: Option<i64>,
    pub link_clicks: Option<i64>,
    pub video_views: Option<i64>,
}

impl DailyMetrics {
    pub fn get(&self, metric: DailyMetric) -> Option<i64> {
        match metric {
            DailyMetric::Impressions => self.impressions,
            DailyMetric::Reach => self.reach,
            DailyMetric::Engagements => self.engagements,
            DailyMetric::ProfileViews => self.profile_views,
            DailyMetric::FollowerCount => self.follower_count,
            DailyMetric::LinkClicks => self.link_clicks,
            DailyMetric::VideoViews => self.video_views,
        }
    }

    pub fn set(&mut self, metric: DailyMetric, value: i64) {
        let slot = match metric {
            DailyMetric::Impressions => &mut self.impressions,
            DailyMetric::Reach => &mut self.reach,
            DailyMetric::Engagements => &mut self.engagements,
            DailyMetric::ProfileViews => &mut self.profile_views,
            DailyMetric::FollowerCount => &mut self.follower_count,
            DailyMetric::LinkClicks => &mut self.link_clicks,
            DailyMetric::VideoViews => &mut self.video_views,
        };
        *slot = Some(value);
    }

    /// Column-wise merge: every metric present in `newer` overwrites, the rest is kept.
    pub fn merge(&mut self, newer: &DailyMetrics) {
        for metric in DailyMetric::ALL {
            if let Some(value) = newer.get(metric) {
                self.set(metric, value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        DailyMetric::ALL.iter().all(|m| self.get(*m).is_none())
    }

    /// Builds the typed record from named values; unknown names are dropped.
    pub fn from_values(values: &MetricValues) -> Self {
        let mut out = Self::default();
        for (name, value) in values {
            if let Some(metric) = DailyMetric::from_provider_name(name) {
                out.set(metric, *value);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostMetric {
    Impressions,
    Reach,
    Engagement,
    Saved,
    VideoViews,
}

impl PostMetric {
    pub const ALL: [PostMetric; 5] = [
        PostMetric::Impressions,
        PostMetric::Reach,
        PostMetric::Engagement,
        PostMetric::Saved,
        PostMetric::VideoViews,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            PostMetric::Impressions => "impressions",
            PostMetric::Reach => "reach",
            PostMetric::Engagement => "engagement",
            PostMetric::Saved => "saved",
            PostMetric::VideoViews => "video_views",
        }
    }

    pub fn from_provider_name(name: &str) -> Option<Self> {
        match name {
            "impressions" => Some(PostMetric::Impressions),
            "reach" => Some(PostMetric::Reach),
            "engagement" | "total_interactions" => Some(PostMetric::Engagement),
            "saved" => Some(PostMetric::Saved),
            "video_views" | "plays" => Some(PostMetric::VideoViews),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostMetrics {
    pub impressions: Option<i64>,
    pub reach: Option<i64>,
    pub engagement: Option<i64>,
    pub saved: Option<i64>,
    pub video_views: Option<i64>,
}

impl PostMetrics {
    pub fn get(&self, metric: PostMetric) -> Option<i64> {
        match metric {
            PostMetric::Impressions => self.impressions,
            PostMetric::Reach => self.reach,
            PostMetric::Engagement => self.engagement,
            PostMetric::Saved => self.saved,
            PostMetric::VideoViews => self.video_views,
        }
    }

    pub fn set(&mut self, metric: PostMetric, value: i64) {
        let slot = match metric {
            PostMetric::Impressions => &mut self.impressions,
            PostMetric::Reach => &mut self.reach,
            PostMetric::Engagement => &mut self.engagement,
            PostMetric::Saved => &mut self.saved,
            PostMetric::VideoViews => &mut self.video_views,
        };
        *slot = Some(value);
    }

    pub fn merge(&mut self, newer: &PostMetrics) {
        for metric in PostMetric::ALL {
            if let Some(value) = newer.get(metric) {
                self.set(metric, value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        PostMetric::ALL.iter().all(|m| self.get(*m).is_none())
    }

    pub fn from_values(values: &MetricValues) -> Self {
        let mut out = Self::default();
        for (name, value) in values {
            if let Some(metric) = PostMetric::from_provider_name(name) {
                out.set(metric, *value);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DailyMetricKey {
    pub user_id: Uuid,
    pub account_ref: String,
    pub platform: Platform,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetricRow {
    pub user_id: Uuid,
    pub account_ref: String,
    pub platform: Platform,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub metrics: DailyMetrics,
}

impl DailyMetricRow {
    pub fn key(&self) -> DailyMetricKey {
        DailyMetricKey {
            user_id: self.user_id,
            account_ref: self.account_ref.clone(),
            platform: self.platform,
            date: self.date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostKey {
    pub user_id: Uuid,
    pub platform: Platform,
    pub post_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub user_id: Uuid,
    pub platform: Platform,
    pub post_id: String,
    pub created_time: DateTime<Utc>,
    pub caption: Option<String>,
    pub media_type: String,
    pub permalink: Option<String>,
    pub like_count: i64,
    pub comment_count: i64,
    pub thumbnail_url: Option<String>,
}

impl Post {
    pub fn key(&self) -> PostKey {
        PostKey {
            user_id: self.user_id,
            platform: self.platform,
            post_id: self.post_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostMetricKey {
    pub user_id: Uuid,
    pub platform: Platform,
    pub post_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetricRow {
    pub user_id: Uuid,
    pub platform: Platform,
    pub post_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub metrics: PostMetrics,
}

impl PostMetricRow {
    pub fn key(&self) -> PostMetricKey {
        PostMetricKey {
            user_id: self.user_id,
            platform: self.platform,
            post_id: self.post_id.clone(),
            date: self.date,
        }
    }
}

/// Provider insight after wire decoding: a metric name and its samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    pub name: String,
    pub values: Vec<InsightSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightSample {
    pub value: i64,
    /// Absent for lifetime (media) insights.
    pub end_time: Option<DateTime<FixedOffset>>,
}

/// Calendar date of `at` in the provider's reporting offset.
pub fn reporting_date(at: DateTime<Utc>, reporting_offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&reporting_offset).date_naive()
}

/// Pivots `{metric, samples[]}` into one partial row per observed date.
///
/// The key set is the union of the dates of every sample; a metric that has no sample
/// for a date is simply missing from that row. Samples without an `end_time` carry no
/// date and are ignored.
pub fn normalize_insights(
    insights: &[Insight],
    reporting_offset: FixedOffset,
) -> BTreeMap<NaiveDate, MetricValues> {
    let mut rows: BTreeMap<NaiveDate, MetricValues> = BTreeMap::new();
    for insight in insights {
        for sample in &insight.values {
            let Some(end_time) = sample.end_time else {
                continue;
            };
            let date = end_time.with_timezone(&reporting_offset).date_naive();
            rows.entry(date)
                .or_default()
                .insert(insight.name.clone(), sample.value);
        }
    }
    rows
}

/// First sample of each insight; used for lifetime-to-date media metrics.
pub fn lifetime_snapshot(insights: &[Insight]) -> MetricValues {
    insights
        .iter()
        .filter_map(|insight| {
            insight
                .values
                .first()
                .map(|sample| (insight.name.clone(), sample.value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn ts(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).expect("timestamp")
    }

    fn insight(name: &str, samples: &[(i64, &str)]) -> Insight {
        Insight {
            name: name.to_string(),
            values: samples
                .iter()
                .map(|(value, at)| InsightSample {
                    value: *value,
                    end_time: Some(ts(at)),
                })
                .collect(),
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn normalized_dates_are_union_of_metric_dates() {
        let insights = vec![
            insight(
                "impressions",
                &[(10, "2026-03-01T08:00:00Z"), (12, "2026-03-02T08:00:00Z")],
            ),
            insight(
                "reach",
                &[(5, "2026-03-02T08:00:00Z"), (7, "2026-03-03T08:00:00Z")],
            ),
        ];
        let rows = normalize_insights(&insights, utc());

        let expected: BTreeSet<NaiveDate> = insights
            .iter()
            .flat_map(|i| i.values.iter())
            .map(|s| s.end_time.unwrap().date_naive())
            .collect();
        assert_eq!(rows.keys().copied().collect::<BTreeSet<_>>(), expected);

        assert_eq!(rows[&day("2026-03-01")].get("impressions"), Some(&10));
        assert_eq!(rows[&day("2026-03-01")].get("reach"), None);
        assert_eq!(rows[&day("2026-03-02")].len(), 2);
        assert_eq!(rows[&day("2026-03-03")].get("reach"), Some(&7));
        assert_eq!(rows[&day("2026-03-03")].get("impressions"), None);
    }

    #[test]
    fn empty_insights_normalize_to_empty_map() {
        assert!(normalize_insights(&[], utc()).is_empty());
        let no_samples = vec![Insight {
            name: "reach".into(),
            values: vec![],
        }];
        assert!(normalize_insights(&no_samples, utc()).is_empty());
    }

    #[test]
    fn dates_truncate_in_reporting_offset() {
        let insights = vec![insight("reach", &[(3, "2026-03-02T07:00:00Z")])];
        let pacific = FixedOffset::west_opt(8 * 3600).unwrap();
        let rows = normalize_insights(&insights, pacific);
        assert_eq!(rows.keys().next().copied(), Some(day("2026-03-01")));

        let rows = normalize_insights(&insights, utc());
        assert_eq!(rows.keys().next().copied(), Some(day("2026-03-02")));
    }

    #[test]
    fn samples_without_end_time_are_ignored() {
        let insights = vec![Insight {
            name: "reach".into(),
            values: vec![InsightSample {
                value: 9,
                end_time: None,
            }],
        }];
        assert!(normalize_insights(&insights, utc()).is_empty());
        assert_eq!(lifetime_snapshot(&insights).get("reach"), Some(&9));
    }

    #[test]
    fn typed_metrics_map_provider_names_and_drop_unknown() {
        let mut values = MetricValues::new();
        values.insert("page_impressions".into(), 100);
        values.insert("page_engaged_users".into(), 8);
        values.insert("mystery_metric".into(), 1);
        let metrics = DailyMetrics::from_values(&values);
        assert_eq!(metrics.impressions, Some(100));
        assert_eq!(metrics.engagements, Some(8));
        assert_eq!(metrics.reach, None);

        let mut unknown_only = MetricValues::new();
        unknown_only.insert("mystery_metric".into(), 1);
        assert!(DailyMetrics::from_values(&unknown_only).is_empty());
    }

    #[test]
    fn merge_overwrites_present_columns_only() {
        let mut stored = DailyMetrics {
            impressions: Some(1),
            reach: Some(2),
            ..Default::default()
        };
        stored.merge(&DailyMetrics {
            reach: Some(20),
            follower_count: Some(300),
            ..Default::default()
        });
        assert_eq!(stored.impressions, Some(1));
        assert_eq!(stored.reach, Some(20));
        assert_eq!(stored.follower_count, Some(300));

        let mut post = PostMetrics {
            saved: Some(4),
            ..Default::default()
        };
        post.merge(&PostMetrics::from_values(&MetricValues::from([(
            "engagement".to_string(),
            11,
        )])));
        assert_eq!(post.saved, Some(4));
        assert_eq!(post.engagement, Some(11));
    }

    #[test]
    fn access_token_rejects_missing_and_blank_values() {
        let user = Uuid::new_v4();
        let mut account = ConnectedAccount::new(user, META_PROVIDER, "tok-123", None);
        assert_eq!(account.access_token(), Some("tok-123"));

        account.token = serde_json::json!({ "access_token": "   " });
        assert_eq!(account.access_token(), None);

        account.token = serde_json::json!("not-an-object");
        assert_eq!(account.access_token(), None);
    }

    #[test]
    fn expiry_is_inclusive_of_now() {
        let now = Utc::now();
        let account = ConnectedAccount::new(Uuid::new_v4(), META_PROVIDER, "t", Some(now));
        assert!(account.is_expired(now));
        let open_ended = ConnectedAccount::new(Uuid::new_v4(), META_PROVIDER, "t", None);
        assert!(!open_ended.is_expired(now));
    }
}
