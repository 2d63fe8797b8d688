//! KPI cards computed from daily metric rows.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use pulse_core::{DailyMetricRow, Platform};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiCard<T> {
    pub value: T,
    pub previous: T,
    pub delta: T,
    pub delta_percent: f64,
}

impl KpiCard<i64> {
    fn compare(value: i64, previous: i64) -> Self {
        let delta = value - previous;
        Self {
            value,
            previous,
            delta,
            delta_percent: percent_of(delta as f64, previous as f64),
        }
    }
}

impl KpiCard<f64> {
    fn compare(value: f64, previous: f64) -> Self {
        let delta = value - previous;
        Self {
            value,
            previous,
            delta,
            delta_percent: percent_of(delta, previous),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiReport {
    pub impressions: KpiCard<i64>,
    pub reach: KpiCard<i64>,
    pub engagement_rate: KpiCard<f64>,
    pub follower_growth: KpiCard<i64>,
    pub link_clicks: KpiCard<i64>,
    pub video_views: KpiCard<i64>,
    pub profile_views: KpiCard<i64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    impressions: i64,
    reach: i64,
    engagements: i64,
    profile_views: i64,
    link_clicks: i64,
    video_views: i64,
}

impl Totals {
    fn sum(rows: &[DailyMetricRow]) -> Self {
        rows.iter().fold(Self::default(), |mut acc, row| {
            let m = &row.metrics;
            acc.impressions += m.impressions.unwrap_or(0);
            acc.reach += m.reach.unwrap_or(0);
            acc.engagements += m.engagements.unwrap_or(0);
            acc.profile_views += m.profile_views.unwrap_or(0);
            acc.link_clicks += m.link_clicks.unwrap_or(0);
            acc.video_views += m.video_views.unwrap_or(0);
            acc
        })
    }

    /// Engagements per 100 reached accounts.
    fn engagement_rate(&self) -> f64 {
        percent_of(self.engagements as f64, self.reach as f64)
    }
}

fn percent_of(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

/// Growth summed over accounts that report a follower count, with the summed starting count.
/// Each account contributes its last reported count minus its first; rows must be date-ordered.
fn follower_growth(rows: &[DailyMetricRow]) -> (i64, i64) {
    let mut per_account: BTreeMap<(&str, Platform), (i64, i64)> = BTreeMap::new();
    for row in rows {
        let Some(followers) = row.metrics.follower_count else {
            continue;
        };
        per_account
            .entry((row.account_ref.as_str(), row.platform))
            .and_modify(|(_, last)| *last = followers)
            .or_insert((followers, followers));
    }
    per_account
        .values()
        .fold((0, 0), |(growth, start), (first, last)| {
            (growth + (last - first), start + first)
        })
}

/// The equally long window that ends the day before `from`.
pub fn previous_window(from: NaiveDate, to: NaiveDate) -> (NaiveDate, NaiveDate) {
    let span_days = (to - from).num_days();
    (from - Duration::days(span_days + 1), from - Duration::days(1))
}

pub fn compute_kpis(current: &[DailyMetricRow], previous: &[DailyMetricRow]) -> KpiReport {
    let now = Totals::sum(current);
    let before = Totals::sum(previous);
    let (growth, starting_followers) = follower_growth(current);
    let (previous_growth, _) = follower_growth(previous);

    KpiReport {
        impressions: KpiCard::<i64>::compare(now.impressions, before.impressions),
        reach: KpiCard::<i64>::compare(now.reach, before.reach),
        engagement_rate: KpiCard::<f64>::compare(now.engagement_rate(), before.engagement_rate()),
        follower_growth: KpiCard {
            value: growth,
            previous: previous_growth,
            delta: growth - previous_growth,
            // growth relative to the follower count at the start of the window
            delta_percent: percent_of(growth as f64, starting_followers as f64),
        },
        link_clicks: KpiCard::<i64>::compare(now.link_clicks, before.link_clicks),
        video_views: KpiCard::<i64>::compare(now.video_views, before.video_views),
        profile_views: KpiCard::<i64>::compare(now.profile_views, before.profile_views),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::DailyMetrics;
    use uuid::Uuid;

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    fn row(date: &str, metrics: DailyMetrics) -> DailyMetricRow {
        account_row("ig1", Platform::Instagram, date, metrics)
    }

    fn account_row(
        account_ref: &str,
        platform: Platform,
        date: &str,
        metrics: DailyMetrics,
    ) -> DailyMetricRow {
        DailyMetricRow {
            user_id: Uuid::nil(),
            account_ref: account_ref.into(),
            platform,
            date: day(date),
            metrics,
        }
    }

    #[test]
    fn previous_window_has_equal_length_and_ends_before_from() {
        let (from, to) = previous_window(day("2026-03-08"), day("2026-03-14"));
        assert_eq!(from, day("2026-03-01"));
        assert_eq!(to, day("2026-03-07"));

        let (from, to) = previous_window(day("2026-03-08"), day("2026-03-08"));
        assert_eq!((from, to), (day("2026-03-07"), day("2026-03-07")));
    }

    #[test]
    fn totals_and_rates_compare_against_previous_window() {
        let current = vec![
            row(
                "2026-03-08",
                DailyMetrics {
                    impressions: Some(300),
                    reach: Some(100),
                    engagements: Some(10),
                    follower_count: Some(200),
                    ..Default::default()
                },
            ),
            row(
                "2026-03-09",
                DailyMetrics {
                    impressions: Some(300),
                    reach: Some(100),
                    engagements: Some(30),
                    follower_count: Some(230),
                    ..Default::default()
                },
            ),
        ];
        let previous = vec![row(
            "2026-03-07",
            DailyMetrics {
                impressions: Some(400),
                reach: Some(100),
                engagements: Some(10),
                ..Default::default()
            },
        )];

        let kpis = compute_kpis(&current, &previous);
        assert_eq!(kpis.impressions.value, 600);
        assert_eq!(kpis.impressions.previous, 400);
        assert_eq!(kpis.impressions.delta, 200);
        assert!((kpis.impressions.delta_percent - 50.0).abs() < 1e-9);

        assert!((kpis.engagement_rate.value - 20.0).abs() < 1e-9);
        assert!((kpis.engagement_rate.previous - 10.0).abs() < 1e-9);
        assert!((kpis.engagement_rate.delta_percent - 100.0).abs() < 1e-9);

        assert_eq!(kpis.follower_growth.value, 30);
        assert!((kpis.follower_growth.delta_percent - 15.0).abs() < 1e-9);
    }

    #[test]
    fn empty_previous_window_reports_zero_delta_percent() {
        let current = vec![row(
            "2026-03-08",
            DailyMetrics {
                link_clicks: Some(7),
                ..Default::default()
            },
        )];
        let kpis = compute_kpis(&current, &[]);
        assert_eq!(kpis.link_clicks.delta, 7);
        assert_eq!(kpis.link_clicks.delta_percent, 0.0);
        assert_eq!(kpis.engagement_rate.value, 0.0);

        let json = serde_json::to_value(&kpis).unwrap();
        assert_eq!(json["linkClicks"]["deltaPercent"], 0.0);
        assert_eq!(json["followerGrowth"]["value"], 0);
    }

    #[test]
    fn follower_growth_ignores_rows_without_follower_counts() {
        let page = |date| {
            account_row(
                "104857600011",
                Platform::Facebook,
                date,
                DailyMetrics {
                    impressions: Some(50),
                    ..Default::default()
                },
            )
        };
        let ig = |date, followers| {
            account_row(
                "17841400000000001",
                Platform::Instagram,
                date,
                DailyMetrics {
                    follower_count: Some(followers),
                    ..Default::default()
                },
            )
        };
        let current = vec![
            page("2026-03-01"),
            ig("2026-03-01", 1000),
            page("2026-03-02"),
            ig("2026-03-02", 1003),
        ];

        let kpis = compute_kpis(&current, &[]);
        assert_eq!(kpis.follower_growth.value, 3);
        assert!((kpis.follower_growth.delta_percent - 0.3).abs() < 1e-9);
    }

    #[test]
    fn follower_growth_sums_each_account() {
        let ig = |account, date, followers| {
            account_row(
                account,
                Platform::Instagram,
                date,
                DailyMetrics {
                    follower_count: Some(followers),
                    ..Default::default()
                },
            )
        };
        let current = vec![
            ig("igA", "2026-03-01", 100),
            ig("igB", "2026-03-01", 400),
            ig("igA", "2026-03-02", 110),
            ig("igB", "2026-03-02", 390),
        ];

        let kpis = compute_kpis(&current, &[]);
        assert_eq!(kpis.follower_growth.value, 0);
        assert_eq!(kpis.follower_growth.previous, 0);

        let current = vec![ig("igA", "2026-03-01", 100), ig("igA", "2026-03-03", 125)];
        let kpis = compute_kpis(&current, &[]);
        assert_eq!(kpis.follower_growth.value, 25);
        assert!((kpis.follower_growth.delta_percent - 25.0).abs() < 1e-9);
    }
}
