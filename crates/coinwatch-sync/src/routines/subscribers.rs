//! Daily subscriber history per coin and platform, and the trends derived from it.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use coinwatch_adapters::{
    discord_count_on_page, reddit_about_url, reddit_subscribers, telegram_count_on_page,
    twitter_account_name, AdapterError, Platform,
};
use coinwatch_core::{EntityKind, FetchOutcome, FieldValue, NormalizedRecord, RecordKey};
use coinwatch_storage::RecordFilter;
use scraper::Html;
use tracing::debug;

use super::{saved_message, ServiceContext, SUBSCRIBER_COUNTS};
use crate::reconcile::index_by_key;
use crate::routine::{RoutineError, RoutineWork, WorkOutcome};
use crate::sink::Warning;

const LOOKUP_PAUSE: Duration = Duration::from_secs(1);
const RETRY_PAUSE: Duration = Duration::from_secs(30);

pub const COUNT_FIELD: &str = "subscriber_count";
pub const PLATFORM_FIELD: &str = "platform_name";

/// Window label and the index of the day it compares against, newest day first.
const TREND_WINDOWS: [(&str, usize); 6] = [
    ("days_3", 2),
    ("days_7", 6),
    ("days_14", 13),
    ("days_30", 29),
    ("days_60", 59),
    ("days_90", 89),
];

fn telegram_count(html: &str) -> Result<i64, AdapterError> {
    Ok(telegram_count_on_page(&Html::parse_document(html))?.unwrap_or(0))
}

fn discord_count(html: &str) -> Result<i64, AdapterError> {
    Ok(discord_count_on_page(&Html::parse_document(html))?.unwrap_or(0))
}

pub struct SubscriberCounts {
    ctx: ServiceContext,
}

impl SubscriberCounts {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// `None` when the source could not be reached; a reachable source without a count is 0.
    async fn read_count(&self, platform: Platform, url: &str) -> Result<Option<i64>, RoutineError> {
        let ctx = &self.ctx;
        let count = match platform {
            Platform::Reddit => match ctx.fetch_json(&reddit_about_url(url)).await? {
                FetchOutcome::Success(about) => Some(reddit_subscribers(&about).unwrap_or(0)),
                _ => None,
            },
            Platform::Telegram => match ctx.scrape(url).await? {
                FetchOutcome::Success(page) => Some(telegram_count(&page.html)?),
                _ => None,
            },
            Platform::Discord => match ctx.scrape(url).await? {
                FetchOutcome::Success(page) => Some(discord_count(&page.html)?),
                _ => None,
            },
            Platform::Twitter => {
                let (Some(followers), Some(account)) = (ctx.followers.as_ref(), twitter_account_name(url)) else {
                    return Ok(Some(0));
                };
                Some(followers.followers(&account).await.success().unwrap_or(0))
            }
            Platform::Github => Some(0),
        };
        Ok(count)
    }

    async fn platform_count(&self, coin_id: &str, platform: Platform, url: &str) -> Result<i64, RoutineError> {
        let attempts = self.ctx.key_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(count) = self.read_count(platform, url).await? {
                return Ok(count);
            }
            debug!(coin_id, platform = platform.as_str(), attempt, "subscriber lookup failed");
            if attempt < attempts {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
        self.ctx.sink.warn(SUBSCRIBER_COUNTS, &Warning::FetchFailure);
        Ok(0)
    }
}

#[async_trait]
impl RoutineWork for SubscriberCounts {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let today = now.date_naive();

        let today_rows = index_by_key(
            ctx.store
                .get_filtered(EntityKind::SubscriberCount, &RecordFilter::WrittenOn(today))
                .await?,
        );
        let counted_today: HashSet<&str> = today_rows.keys().map(RecordKey::natural).collect();

        let mut records = Vec::new();
        for social in ctx.store.get_all(EntityKind::SocialLinks).await? {
            let coin_id = social.key().natural().to_string();
            if counted_today.contains(coin_id.as_str()) {
                continue;
            }
            for platform in Platform::SOCIAL {
                let url = social.record.text(platform.as_str()).unwrap_or_default().trim();
                let count = if url.is_empty() {
                    0
                } else {
                    let count = self.platform_count(&coin_id, platform, url).await?;
                    tokio::time::sleep(LOOKUP_PAUSE).await;
                    count
                };
                let key = RecordKey::Dated {
                    natural: coin_id.clone(),
                    platform: platform.as_str().to_string(),
                    date: today,
                };
                records.push(
                    NormalizedRecord::new(EntityKind::SubscriberCount, key)
                        .with_field(coinwatch_core::NATURAL_KEY_FIELD, coin_id.clone())
                        .with_field(PLATFORM_FIELD, platform.as_str())
                        .with_field(COUNT_FIELD, count),
                );
            }
        }

        let plan = ctx
            .engine
            .reconcile(EntityKind::SubscriberCount, records, &today_rows, now);
        let summary = ctx.commit(vec![plan], now).await?;
        Ok(WorkOutcome::Completed(saved_message(summary)))
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Relative change per window for daily totals ordered newest first. Windows without
/// enough history, or a zero newest total, are left out.
pub fn trend_windows(daily: &[i64]) -> Vec<(&'static str, f64)> {
    let Some(&newest) = daily.first() else {
        return Vec::new();
    };
    if newest == 0 {
        return Vec::new();
    }
    TREND_WINDOWS
        .iter()
        .filter(|(_, idx)| daily.len() > *idx)
        .map(|(label, idx)| {
            let ratio = round3(daily[*idx] as f64 / newest as f64);
            (*label, round3(1.0 - ratio))
        })
        .collect()
}

pub struct SubscriberTrends {
    ctx: ServiceContext,
}

impl SubscriberTrends {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RoutineWork for SubscriberTrends {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError> {
        let ctx = &self.ctx;
        let mut totals: BTreeMap<String, BTreeMap<chrono::NaiveDate, i64>> = BTreeMap::new();
        for row in ctx.store.get_all(EntityKind::SubscriberCount).await? {
            let RecordKey::Dated { natural, date, .. } = row.key() else {
                continue;
            };
            let count = row.record.get(COUNT_FIELD).and_then(FieldValue::as_i64).unwrap_or(0);
            *totals
                .entry(natural.clone())
                .or_default()
                .entry(*date)
                .or_default() += count;
        }

        let records: Vec<_> = totals
            .into_iter()
            .map(|(coin_id, days)| {
                let daily: Vec<i64> = days.into_values().rev().collect();
                trend_windows(&daily)
                    .into_iter()
                    .fold(NormalizedRecord::natural(EntityKind::Trend, coin_id), |record, (label, value)| {
                        record.with_field(label, value)
                    })
            })
            .collect();

        // Trend rows are replaced whole.
        let now = ctx.now();
        let summary = ctx.store.upsert(records, now).await?;
        Ok(WorkOutcome::Completed(saved_message(summary)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routines::fakes::FakeWeb;
    use crate::sink::{RecordingSink, Reported};
    use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
    use coinwatch_adapters::FollowerCounter;
    use coinwatch_core::ManualClock;
    use coinwatch_storage::{MemoryStore, Persistence};
    use serde_json::json;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    struct FixedFollowers(i64);

    #[async_trait]
    impl FollowerCounter for FixedFollowers {
        async fn followers(&self, _account: &str) -> FetchOutcome<i64> {
            FetchOutcome::Success(self.0)
        }
    }

    async fn store_with_socials(fields: &[(&str, &str)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let record = fields
            .iter()
            .fold(NormalizedRecord::natural(EntityKind::SocialLinks, "bitcoin"), |r, (k, v)| {
                r.with_field(*k, *v)
            });
        store.insert(vec![record], t0()).await.unwrap();
        store
    }

    fn count_of(store: &MemoryStore, platform: &str) -> Option<i64> {
        store
            .snapshot(EntityKind::SubscriberCount)
            .into_iter()
            .find(|p| p.record.text(PLATFORM_FIELD) == Some(platform))
            .and_then(|p| p.record.get(COUNT_FIELD).and_then(FieldValue::as_i64))
    }

    #[test]
    fn trend_windows_need_enough_history() {
        assert_eq!(trend_windows(&[100, 95, 90]), vec![("days_3", 0.1)]);
        assert!(trend_windows(&[100, 95]).is_empty());
        assert!(trend_windows(&[0, 10, 10]).is_empty());

        let mut daily = vec![1000i64; 7];
        daily[6] = 800;
        assert_eq!(trend_windows(&daily), vec![("days_3", 0.0), ("days_7", 0.2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_are_read_per_platform_once_a_day() {
        let store = store_with_socials(&[
            ("reddit", "https://www.reddit.com/r/Bitcoin/"),
            ("telegram", "https://t.me/bitcoin"),
            ("discord", "https://discord.com/invite/bitcoin"),
            ("twitter", "https://twitter.com/bitcoin"),
        ])
        .await;
        let web = Arc::new(
            FakeWeb::new()
                .json(
                    "https://www.reddit.com/r/Bitcoin/about.json",
                    FetchOutcome::Success(json!({"data": {"subscribers": 5000}})),
                )
                .page(
                    "https://t.me/bitcoin",
                    r#"<div class="tgme_page_extra">1 204 subscribers</div>"#,
                )
                .page(
                    "https://discord.com/invite/bitcoin",
                    r#"<meta name="description" content="Join 3,100 other members">"#,
                ),
        );
        let clock = Arc::new(ManualClock::new(t0()));
        let ctx = ServiceContext::new(store.clone(), clock.clone())
            .with_json(web.clone())
            .with_pages(web.clone())
            .with_followers(Arc::new(FixedFollowers(42)));
        let work = SubscriberCounts::new(ctx);

        work.execute().await.unwrap();
        assert_eq!(count_of(&store, "reddit"), Some(5000));
        assert_eq!(count_of(&store, "telegram"), Some(1204));
        assert_eq!(count_of(&store, "discord"), Some(3100));
        assert_eq!(count_of(&store, "twitter"), Some(42));

        let requests = web.requests.lock().unwrap().len();
        work.execute().await.unwrap();
        assert_eq!(web.requests.lock().unwrap().len(), requests, "same day is not fetched again");
        assert_eq!(store.count(EntityKind::SubscriberCount), 4);

        clock.advance(ChronoDuration::days(1));
        work.execute().await.unwrap();
        assert_eq!(store.count(EntityKind::SubscriberCount), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_platforms_count_zero_after_retries() {
        let store = store_with_socials(&[("reddit", "https://www.reddit.com/r/Gone/"), ("telegram", "")]).await;
        let web = Arc::new(FakeWeb::new());
        let sink = Arc::new(RecordingSink::new());
        let ctx = ServiceContext::new(store.clone(), Arc::new(ManualClock::new(t0())))
            .with_json(web.clone())
            .with_sink(sink.clone());

        let started = tokio::time::Instant::now();
        SubscriberCounts::new(ctx).execute().await.unwrap();

        assert_eq!(web.requested("https://www.reddit.com/r/Gone/about.json"), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(3 * 30 + 1));
        assert_eq!(count_of(&store, "reddit"), Some(0));
        assert_eq!(count_of(&store, "telegram"), Some(0));
        assert_eq!(count_of(&store, "twitter"), Some(0));
        assert_eq!(
            sink.events(),
            vec![Reported::Warn(SUBSCRIBER_COUNTS.into(), Warning::FetchFailure)]
        );
    }

    #[tokio::test]
    async fn trends_sum_platforms_per_day() {
        let store = Arc::new(MemoryStore::new());
        let day = |offset: i64| NaiveDate::from_ymd_opt(2026, 3, 10).unwrap() - ChronoDuration::days(offset);
        let mut rows = Vec::new();
        for (offset, reddit, telegram) in [(0, 600, 400), (1, 550, 400), (2, 500, 300)] {
            for (platform, count) in [("reddit", reddit), ("telegram", telegram)] {
                let key = RecordKey::Dated {
                    natural: "bitcoin".into(),
                    platform: platform.into(),
                    date: day(offset),
                };
                rows.push(NormalizedRecord::new(EntityKind::SubscriberCount, key).with_field(COUNT_FIELD, count as i64));
            }
        }
        store.insert(rows, t0()).await.unwrap();

        let ctx = ServiceContext::new(store.clone(), Arc::new(ManualClock::new(t0())));
        SubscriberTrends::new(ctx.clone()).execute().await.unwrap();
        SubscriberTrends::new(ctx).execute().await.unwrap();

        let trends = store.snapshot(EntityKind::Trend);
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].record.get("days_3").and_then(FieldValue::as_f64), Some(0.2));
        assert!(trends[0].record.get("days_7").is_none());
    }

    fn daily_row(date: NaiveDate, platform: &str, count: i64) -> NormalizedRecord {
        let key = RecordKey::Dated {
            natural: "bitcoin".into(),
            platform: platform.into(),
            date,
        };
        NormalizedRecord::new(EntityKind::SubscriberCount, key).with_field(COUNT_FIELD, count)
    }

    #[tokio::test]
    async fn trend_windows_that_no_longer_apply_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let day = |n: u32| NaiveDate::from_ymd_opt(2026, 3, n).unwrap();
        store
            .insert(
                vec![daily_row(day(1), "reddit", 500), daily_row(day(2), "reddit", 550), daily_row(day(3), "reddit", 600)],
                t0(),
            )
            .await
            .unwrap();
        let ctx = ServiceContext::new(store.clone(), Arc::new(ManualClock::new(t0())));

        SubscriberTrends::new(ctx.clone()).execute().await.unwrap();
        let first = store.snapshot(EntityKind::Trend);
        assert_eq!(first[0].record.get("days_3").and_then(FieldValue::as_f64), Some(0.167));

        store.insert(vec![daily_row(day(4), "reddit", 0)], t0()).await.unwrap();
        SubscriberTrends::new(ctx).execute().await.unwrap();

        let second = store.snapshot(EntityKind::Trend);
        assert_eq!(second.len(), 1);
        assert!(second[0].record.get("days_3").is_none());
        assert_eq!(second[0].record.text(coinwatch_core::NATURAL_KEY_FIELD), Some("bitcoin"));
    }

    /// Refuses full history scans so only today's rows can be read.
    struct TodayOnlyHistory(MemoryStore);

    #[async_trait]
    impl Persistence for TodayOnlyHistory {
        async fn get_all(
            &self,
            kind: EntityKind,
        ) -> Result<Vec<coinwatch_core::PersistedRecord>, coinwatch_storage::StoreError> {
            if kind == EntityKind::SubscriberCount {
                return Err(coinwatch_storage::StoreError::Malformed("full history scan".into()));
            }
            self.0.get_all(kind).await
        }

        async fn get_filtered(
            &self,
            kind: EntityKind,
            filter: &RecordFilter,
        ) -> Result<Vec<coinwatch_core::PersistedRecord>, coinwatch_storage::StoreError> {
            self.0.get_filtered(kind, filter).await
        }

        async fn commit(
            &self,
            batch: coinwatch_storage::WriteBatch,
            written_at: DateTime<Utc>,
        ) -> Result<coinwatch_storage::CommitSummary, coinwatch_storage::StoreError> {
            self.0.commit(batch, written_at).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn daily_counts_read_only_todays_history() {
        let inner = MemoryStore::new();
        let yesterday = t0().date_naive() - ChronoDuration::days(1);
        inner
            .insert(
                vec![NormalizedRecord::natural(EntityKind::SocialLinks, "bitcoin")
                    .with_field("reddit", "https://www.reddit.com/r/Bitcoin/")],
                t0(),
            )
            .await
            .unwrap();
        inner.insert(vec![daily_row(yesterday, "reddit", 4900)], t0()).await.unwrap();
        let store = Arc::new(TodayOnlyHistory(inner));
        let web = Arc::new(FakeWeb::new().json(
            "https://www.reddit.com/r/Bitcoin/about.json",
            FetchOutcome::Success(json!({"data": {"subscribers": 5000}})),
        ));
        let ctx = ServiceContext::new(store.clone(), Arc::new(ManualClock::new(t0()))).with_json(web);

        SubscriberCounts::new(ctx).execute().await.unwrap();

        let today = store
            .get_filtered(EntityKind::SubscriberCount, &RecordFilter::WrittenOn(t0().date_naive()))
            .await
            .unwrap();
        assert_eq!(today.len(), 4);
        assert_eq!(count_of(&store.0, "reddit"), Some(5000));
    }
}
