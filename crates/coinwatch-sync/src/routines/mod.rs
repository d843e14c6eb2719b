//! Concrete collection routines and the capability bundle they share.

mod market;
mod social;
mod subscribers;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coinwatch_adapters::{CoingeckoEndpoints, FollowerCounter};
use coinwatch_core::{Clock, FetchOutcome};
use coinwatch_storage::{CommitSummary, JsonFetcher, PageScraper, Persistence, ScrapedPage, WriteBatch};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::{CollectorConfig, RoutineRegistry};
use crate::reconcile::{ReconcilePlan, ReconciliationEngine};
use crate::routine::{Routine, RoutineError};
use crate::sink::{OutcomeSink, TracingSink};

pub use market::{ExtendedToplist, Stablecoins, Toplist};
pub use social::{Homepages, SocialLinks};
pub use subscribers::{trend_windows, SubscriberCounts, SubscriberTrends};

pub const STABLECOINS: &str = "stablecoins";
pub const TOPLIST: &str = "toplist";
pub const EXTENDED_TOPLIST: &str = "extended_toplist";
pub const HOMEPAGES: &str = "homepages";
pub const SOCIAL_LINKS: &str = "social_links";
pub const SUBSCRIBER_COUNTS: &str = "subscriber_counts";
pub const SUBSCRIBER_TRENDS: &str = "subscriber_trends";

/// Registration order and default interval in hours.
pub const ROUTINES: [(&str, i64); 7] = [
    (STABLECOINS, 72),
    (TOPLIST, 1),
    (EXTENDED_TOPLIST, 24),
    (HOMEPAGES, 48),
    (SOCIAL_LINKS, 48),
    (SUBSCRIBER_COUNTS, 24),
    (SUBSCRIBER_TRENDS, 24),
];

/// Capabilities injected into every routine. Optional collaborators are checked where used.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn Persistence>,
    pub clock: Arc<dyn Clock>,
    pub engine: Arc<ReconciliationEngine>,
    pub sink: Arc<dyn OutcomeSink>,
    pub json: Option<Arc<dyn JsonFetcher>>,
    pub pages: Option<Arc<dyn PageScraper>>,
    pub followers: Option<Arc<dyn FollowerCounter>>,
    pub endpoints: CoingeckoEndpoints,
    /// Budget for per-key fetches inside a routine.
    pub key_attempts: u32,
    pub detail_spacing: Duration,
    pub extended_batch: usize,
}

impl ServiceContext {
    pub fn new(store: Arc<dyn Persistence>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            engine: Arc::new(ReconciliationEngine::new()),
            sink: Arc::new(TracingSink),
            json: None,
            pages: None,
            followers: None,
            endpoints: CoingeckoEndpoints::default(),
            key_attempts: 4,
            detail_spacing: Duration::from_secs(7),
            extended_batch: 10,
        }
    }

    /// Applies the collector settings that shape routine behaviour.
    pub fn configured(mut self, config: &CollectorConfig) -> Self {
        self.engine = Arc::new(ReconciliationEngine::new().with_base_stale_window(config.base_stale_window()));
        self.endpoints = config.endpoints();
        self.key_attempts = config.retry.attempts;
        self.detail_spacing = config.detail_spacing;
        self.extended_batch = config.extended_batch;
        self
    }

    pub fn with_json(mut self, json: Arc<dyn JsonFetcher>) -> Self {
        self.json = Some(json);
        self
    }

    pub fn with_pages(mut self, pages: Arc<dyn PageScraper>) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_followers(mut self, followers: Arc<dyn FollowerCounter>) -> Self {
        self.followers = Some(followers);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn fetch_json(&self, url: &str) -> Result<FetchOutcome<JsonValue>, RoutineError> {
        let json = self
            .json
            .as_ref()
            .ok_or(RoutineError::MissingCapability("json fetcher"))?;
        Ok(json.fetch_json(url).await)
    }

    async fn scrape(&self, url: &str) -> Result<FetchOutcome<ScrapedPage>, RoutineError> {
        let pages = self
            .pages
            .as_ref()
            .ok_or(RoutineError::MissingCapability("page scraper"))?;
        Ok(pages.scrape(url).await)
    }

    /// Commits every plan in one transaction.
    async fn commit(
        &self,
        plans: Vec<ReconcilePlan>,
        now: DateTime<Utc>,
    ) -> Result<CommitSummary, RoutineError> {
        let mut batch = WriteBatch::new();
        for plan in plans {
            batch.extend(plan.into_batch());
        }
        if batch.is_empty() {
            debug!("nothing to write");
            return Ok(CommitSummary::default());
        }
        Ok(self.store.commit(batch, now).await?)
    }
}

fn saved_message(summary: CommitSummary) -> Option<String> {
    Some(format!(
        "{} inserted, {} updated",
        summary.inserted, summary.upserted
    ))
}

/// Builds one routine by name with its default interval.
pub fn routine_by_name(ctx: &ServiceContext, name: &str) -> Option<Routine> {
    let hours = ROUTINES.iter().find(|(n, _)| *n == name).map(|(_, h)| *h)?;
    let interval = chrono::Duration::hours(hours);
    let routine = match name {
        STABLECOINS => Routine::new(name, interval, Stablecoins::new(ctx.clone())),
        TOPLIST => Routine::new(name, interval, Toplist::new(ctx.clone())),
        EXTENDED_TOPLIST => Routine::new(name, interval, ExtendedToplist::new(ctx.clone())),
        HOMEPAGES => Routine::new(name, interval, Homepages::new(ctx.clone())),
        SOCIAL_LINKS => Routine::new(name, interval, SocialLinks::new(ctx.clone())),
        SUBSCRIBER_COUNTS => Routine::new(name, interval, SubscriberCounts::new(ctx.clone())),
        SUBSCRIBER_TRENDS => Routine::new(name, interval, SubscriberTrends::new(ctx.clone())),
        _ => return None,
    };
    Some(routine.with_sink(ctx.sink.clone()))
}

/// Every enabled routine in registration order, with registry overrides applied.
pub fn build_routines(
    ctx: &ServiceContext,
    config: &CollectorConfig,
    registry: &RoutineRegistry,
) -> Vec<Routine> {
    ROUTINES
        .iter()
        .filter(|(name, _)| registry.is_enabled(name))
        .filter_map(|(name, hours)| {
            let interval = registry.interval_for(name, chrono::Duration::hours(*hours));
            routine_by_name(ctx, name).map(|routine| {
                routine
                    .with_interval(interval)
                    .with_retry(config.retry)
            })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use coinwatch_core::ManualClock;
    use coinwatch_storage::MemoryStore;

    fn ctx() -> ServiceContext {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        ServiceContext::new(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(start)))
    }

    #[test]
    fn registry_controls_membership_and_intervals() {
        let registry: RoutineRegistry = serde_yaml::from_str(
            "routines:\n  - name: toplist\n    interval_hours: 3\n  - name: subscriber_trends\n    enabled: false\n",
        )
        .unwrap();
        let routines = build_routines(&ctx(), &CollectorConfig::default(), &registry);

        let names: Vec<_> = routines.iter().map(Routine::name).collect();
        assert_eq!(
            names,
            vec![
                STABLECOINS,
                TOPLIST,
                EXTENDED_TOPLIST,
                HOMEPAGES,
                SOCIAL_LINKS,
                SUBSCRIBER_COUNTS
            ]
        );
        assert_eq!(routines[1].due().interval(), chrono::Duration::hours(3));
        assert_eq!(routines[0].due().interval(), chrono::Duration::hours(72));
    }

    struct RejectingStore;

    #[async_trait::async_trait]
    impl Persistence for RejectingStore {
        async fn get_all(
            &self,
            _kind: coinwatch_core::EntityKind,
        ) -> Result<Vec<coinwatch_core::PersistedRecord>, coinwatch_storage::StoreError> {
            Ok(Vec::new())
        }

        async fn commit(
            &self,
            _batch: WriteBatch,
            _written_at: DateTime<Utc>,
        ) -> Result<CommitSummary, coinwatch_storage::StoreError> {
            Err(coinwatch_storage::StoreError::Malformed("disk full".into()))
        }
    }

    #[tokio::test]
    async fn persistence_failures_surface_as_cycle_errors() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let web = Arc::new(fakes::FakeWeb::new().json(
            CoingeckoEndpoints::default().stablecoins_url(),
            FetchOutcome::Success(serde_json::json!([{"id": "tether"}])),
        ));
        let sink = Arc::new(crate::sink::RecordingSink::new());
        let ctx = ServiceContext::new(Arc::new(RejectingStore), clock.clone())
            .with_json(web)
            .with_sink(sink.clone());

        let mut scheduler = crate::scheduler::Scheduler::new(Duration::from_secs(360), clock);
        scheduler.add(routine_by_name(&ctx, STABLECOINS).unwrap());
        let summary = scheduler.run_cycle().await;

        assert_eq!(summary.failed, 1);
        assert!(matches!(
            sink.events().as_slice(),
            [crate::sink::Reported::Error(name, msg)] if name == STABLECOINS && msg.contains("disk full")
        ));
    }

    #[test]
    fn unknown_routine_names_build_nothing() {
        assert!(routine_by_name(&ctx(), "market_chart").is_none());
        assert!(routine_by_name(&ctx(), HOMEPAGES).is_some());
    }
}
