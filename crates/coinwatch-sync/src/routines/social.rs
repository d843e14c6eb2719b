//! Homepage extraction and social link discovery for coins with stored raw links.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use coinwatch_adapters::{
    google_search_url, is_bare_platform_link, normalize_platform_link, platform_link_on_page,
    search_result_link, AdapterError, Platform, RawLinks, SearchOutcome,
};
use coinwatch_core::{EntityKind, FetchOutcome, NormalizedRecord, PersistedRecord};
use coinwatch_storage::ScrapedPage;
use scraper::Html;
use tracing::{debug, warn};

use super::{saved_message, ServiceContext, SOCIAL_LINKS};
use crate::reconcile::{index_by_key, new_keys};
use crate::routine::{RoutineError, RoutineWork, WorkOutcome};

const SCRAPE_PAUSE: Duration = Duration::from_secs(1);

pub const HOMEPAGE_FIELD: &str = "homepage_url";

/// Raw link sets of coins that have no record of `target` yet.
async fn unprocessed_links(
    ctx: &ServiceContext,
    target: EntityKind,
) -> Result<Vec<(String, RawLinks)>, RoutineError> {
    let raw = ctx.store.get_all(EntityKind::RawLinks).await?;
    let existing = index_by_key(ctx.store.get_all(target).await?);
    let fresh = new_keys(raw.iter().map(|p| p.key().natural()), &existing);

    let by_key: HashMap<&str, &PersistedRecord> =
        raw.iter().map(|p| (p.key().natural(), p)).collect();
    let mut out = Vec::with_capacity(fresh.len());
    for coin_id in fresh {
        let Some(stored) = by_key.get(coin_id.as_str()) else {
            continue;
        };
        match RawLinks::parse(stored.record.text("links").unwrap_or_default()) {
            Ok(links) => out.push((coin_id, links)),
            Err(err) => warn!(coin_id, error = %err, "unreadable raw links skipped"),
        }
    }
    Ok(out)
}

pub struct Homepages {
    ctx: ServiceContext,
}

impl Homepages {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RoutineWork for Homepages {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError> {
        let ctx = &self.ctx;
        let records: Vec<_> = unprocessed_links(ctx, EntityKind::Homepage)
            .await?
            .into_iter()
            .filter_map(|(coin_id, links)| {
                let url = links.homepage()?.to_string();
                Some(NormalizedRecord::natural(EntityKind::Homepage, coin_id).with_field(HOMEPAGE_FIELD, url))
            })
            .collect();

        let now = ctx.now();
        let plan = ctx
            .engine
            .plan_against(ctx.store.as_ref(), EntityKind::Homepage, records, now)
            .await?;
        let summary = ctx.commit(vec![plan], now).await?;
        Ok(WorkOutcome::Completed(saved_message(summary)))
    }
}

/// Platform anchors found on a homepage.
fn links_on_page(html: &str) -> Result<HashMap<Platform, String>, AdapterError> {
    let document = Html::parse_document(html);
    let mut found = HashMap::new();
    for platform in Platform::SOCIAL {
        if let Some(href) = platform_link_on_page(&document, platform)? {
            found.insert(platform, href);
        }
    }
    Ok(found)
}

fn search_page(html: &str, platform: Platform) -> Result<SearchOutcome, AdapterError> {
    search_result_link(&Html::parse_document(html), platform)
}

pub struct SocialLinks {
    ctx: ServiceContext,
}

impl SocialLinks {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    async fn scrape_with_retry(&self, url: &str) -> Result<Option<ScrapedPage>, RoutineError> {
        for attempt in 1..=self.ctx.key_attempts.max(1) {
            match self.ctx.scrape(url).await? {
                FetchOutcome::Success(page) => return Ok(Some(page)),
                FetchOutcome::Empty => debug!(url, attempt, "empty page"),
                FetchOutcome::Failure(reason) => debug!(url, attempt, %reason, "scrape failed"),
            }
            tokio::time::sleep(SCRAPE_PAUSE).await;
        }
        Ok(None)
    }

    /// First search hit for the platform, or an empty string.
    async fn search(&self, coin_id: &str, platform: Platform) -> Result<String, RoutineError> {
        let url = google_search_url(coin_id, platform);
        for attempt in 1..=self.ctx.key_attempts.max(1) {
            if let FetchOutcome::Success(page) = self.ctx.scrape(&url).await? {
                match search_page(&page.html, platform)? {
                    SearchOutcome::Found(href) => return Ok(href),
                    SearchOutcome::NoMatch => return Ok(String::new()),
                    SearchOutcome::Unavailable => debug!(coin_id, attempt, "search results unavailable"),
                }
            }
            tokio::time::sleep(SCRAPE_PAUSE).await;
        }
        self.ctx.sink.error(
            SOCIAL_LINKS,
            &format!("failed to search {} links for {coin_id}", platform.as_str()),
        );
        Ok(String::new())
    }

    async fn resolve(
        &self,
        coin_id: &str,
        links: &RawLinks,
        homepage: Option<&str>,
    ) -> Result<Option<NormalizedRecord>, RoutineError> {
        let on_page = match homepage {
            Some(url) => match self.scrape_with_retry(url).await? {
                Some(page) => links_on_page(&page.html)?,
                None => {
                    self.ctx.sink.error(
                        SOCIAL_LINKS,
                        &format!("failed to scrape {coin_id} homepage: {url}"),
                    );
                    return Ok(None);
                }
            },
            None => HashMap::new(),
        };

        let mut record = NormalizedRecord::natural(EntityKind::SocialLinks, coin_id)
            .with_field(Platform::Github.as_str(), links.candidate(Platform::Github).unwrap_or_default());
        for platform in Platform::SOCIAL {
            let candidate = on_page
                .get(&platform)
                .cloned()
                .or_else(|| links.candidate(platform))
                .unwrap_or_default();
            let url = if is_bare_platform_link(platform, &candidate) {
                self.search(coin_id, platform).await?
            } else {
                candidate
            };
            record.set(platform.as_str(), normalize_platform_link(platform, &url));
        }
        Ok(Some(record))
    }
}

#[async_trait]
impl RoutineWork for SocialLinks {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError> {
        let ctx = &self.ctx;
        let homepages: HashMap<String, String> = ctx
            .store
            .get_all(EntityKind::Homepage)
            .await?
            .into_iter()
            .filter_map(|p| {
                let url = p.record.text(HOMEPAGE_FIELD)?.to_string();
                Some((p.key().natural().to_string(), url))
            })
            .collect();

        let mut records = Vec::new();
        for (coin_id, links) in unprocessed_links(ctx, EntityKind::SocialLinks).await? {
            let homepage = homepages
                .get(&coin_id)
                .map(String::as_str)
                .or_else(|| links.homepage());
            if let Some(record) = self.resolve(&coin_id, &links, homepage).await? {
                records.push(record);
            }
        }

        let now = ctx.now();
        let plan = ctx
            .engine
            .plan_against(ctx.store.as_ref(), EntityKind::SocialLinks, records, now)
            .await?;
        let summary = ctx.commit(vec![plan], now).await?;
        Ok(WorkOutcome::Completed(saved_message(summary)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routines::fakes::FakeWeb;
    use crate::sink::{RecordingSink, Reported};
    use chrono::{DateTime, TimeZone, Utc};
    use coinwatch_core::ManualClock;
    use coinwatch_storage::{MemoryStore, Persistence};
    use serde_json::json;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
    }

    async fn store_with_raw_links(entries: &[(&str, serde_json::Value)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let records = entries
            .iter()
            .map(|(id, links)| {
                NormalizedRecord::natural(EntityKind::RawLinks, *id).with_field("links", links.to_string())
            })
            .collect();
        store.insert(records, t0()).await.unwrap();
        store
    }

    fn ctx(store: Arc<MemoryStore>, web: Arc<FakeWeb>, sink: Arc<RecordingSink>) -> ServiceContext {
        ServiceContext::new(store, Arc::new(ManualClock::new(t0())))
            .with_pages(web)
            .with_sink(sink)
    }

    #[tokio::test]
    async fn homepages_are_taken_from_raw_links_once() {
        let store = store_with_raw_links(&[
            ("bitcoin", json!({"homepage": ["", "https://bitcoin.org"]})),
            ("nohome", json!({"homepage": [""]})),
        ])
        .await;
        let work = Homepages::new(ServiceContext::new(store.clone(), Arc::new(ManualClock::new(t0()))));

        work.execute().await.unwrap();
        work.execute().await.unwrap();

        let rows = store.snapshot(EntityKind::Homepage);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.text(HOMEPAGE_FIELD), Some("https://bitcoin.org"));
    }

    #[tokio::test(start_paused = true)]
    async fn social_links_combine_raw_links_homepage_and_search() {
        let store = store_with_raw_links(&[(
            "bitcoin",
            json!({
                "homepage": ["https://bitcoin.org"],
                "subreddit_url": "https://www.reddit.com/r/Bitcoin",
                "repos_url": {"github": ["https://github.com/bitcoin/bitcoin"]},
                "chat_url": ["https://discord.com/invite/bitcoin"]
            }),
        )])
        .await;
        let web = Arc::new(
            FakeWeb::new()
                .page(
                    "https://bitcoin.org",
                    r#"<a href="https://twitter.com/bitcoin">x</a><a href="/about">about</a>"#,
                )
                .page(
                    google_search_url("bitcoin", Platform::Telegram),
                    r#"<div id="rso"><a href="https://t.me/s/BitcoinChat">tg</a></div>"#,
                ),
        );
        let sink = Arc::new(RecordingSink::new());

        let outcome = SocialLinks::new(ctx(store.clone(), web, sink.clone())).execute().await.unwrap();
        assert!(matches!(outcome, WorkOutcome::Completed(_)));

        let rows = store.snapshot(EntityKind::SocialLinks);
        let record = &rows[0].record;
        assert_eq!(record.text("reddit"), Some("https://www.reddit.com/r/Bitcoin/"));
        assert_eq!(record.text("discord"), Some("https://discord.com/invite/bitcoin"));
        assert_eq!(record.text("twitter"), Some("https://twitter.com/bitcoin"));
        assert_eq!(record.text("telegram"), Some("https://t.me/bitcoinchat"));
        assert_eq!(record.text("github"), Some("https://github.com/bitcoin/bitcoin"));
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_homepage_skips_the_coin_with_an_error() {
        let store = store_with_raw_links(&[("ghost", json!({"homepage": ["https://ghost.example"]}))]).await;
        let web = Arc::new(FakeWeb::new());
        let sink = Arc::new(RecordingSink::new());

        SocialLinks::new(ctx(store.clone(), web.clone(), sink.clone()))
            .execute()
            .await
            .unwrap();

        assert_eq!(store.count(EntityKind::SocialLinks), 0);
        assert_eq!(web.requested("https://ghost.example"), 4);
        assert!(matches!(
            sink.events().as_slice(),
            [Reported::Error(routine, msg)] if routine == SOCIAL_LINKS && msg.contains("ghost")
        ));
    }
}
