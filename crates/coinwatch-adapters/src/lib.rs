//! Source knowledge: CoinGecko endpoints and datapoints, social-link discovery and
//! subscriber-count extraction from fetched pages.

use std::sync::Arc;

use async_trait::async_trait;
use coinwatch_core::FetchOutcome;
use coinwatch_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "coinwatch-adapters";

pub const COINGECKO_API: &str = "https://api.coingecko.com/api/v3";

/// Fields kept from a toplist market row.
pub const TOPLIST_FIELDS: &[&str] = &[
    "id",
    "symbol",
    "name",
    "current_price",
    "market_cap",
    "market_cap_rank",
    "total_volume",
    "high_24h",
    "low_24h",
    "last_updated",
    "price_change_percentage_1h_in_currency",
    "price_change_percentage_24h_in_currency",
    "price_change_percentage_7d_in_currency",
    "price_change_percentage_14d_in_currency",
    "price_change_percentage_30d_in_currency",
    "price_change_percentage_200d_in_currency",
    "price_change_percentage_1y_in_currency",
];

pub const STABLECOIN_FIELDS: &[&str] = &["id"];

/// Fields kept from a coin detail response.
pub const EXTENDED_FIELDS: &[&str] = &[
    "id",
    "categories",
    "links",
    "watchlist_portfolio_users",
    "coingecko_score",
    "developer_score",
    "community_score",
    "liquidity_score",
    "public_interest_score",
    "developer_data",
];

/// Second-level allow-lists for nested objects of a coin detail response.
pub const EXTENDED_NESTED_FIELDS: &[(&str, &[&str])] = &[
    (
        "links",
        &[
            "homepage",
            "telegram_channel_identifier",
            "subreddit_url",
            "repos_url",
            "chat_url",
        ],
    ),
    (
        "developer_data",
        &[
            "forks",
            "stars",
            "subscribers",
            "total_issues",
            "pull_requests_merged",
            "pull_request_contributors",
            "commit_count_4_weeks",
        ],
    ),
];

/// Slow-changing identity fields split off a toplist row.
pub const BASE_IDENTITY_FIELDS: &[&str] = &["symbol", "name"];
pub const CLASSIFICATION_FIELDS: &[&str] = &["categories"];
pub const RAW_LINK_FIELDS: &[&str] = &["links"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("unreadable links payload: {0}")]
    Links(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoingeckoEndpoints {
    pub currency: String,
    pub toplist_len: u32,
}

impl Default for CoingeckoEndpoints {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            toplist_len: 250,
        }
    }
}

impl CoingeckoEndpoints {
    pub fn stablecoins_url(&self) -> String {
        format!(
            "{COINGECKO_API}/coins/markets?vs_currency={}&category=stablecoins&order=market_cap_desc&per_page=250&page=1&sparkline=false&locale=en",
            self.currency
        )
    }

    pub fn toplist_url(&self) -> String {
        format!(
            "{COINGECKO_API}/coins/markets?vs_currency={}&order=market_cap_desc&per_page={}&page=1&sparkline=false&price_change_percentage=1h%2C24h%2C7d%2C14d%2C30d%2C200d%2C1y&locale=en",
            self.currency, self.toplist_len
        )
    }

    pub fn coin_detail_url(&self, coin_id: &str) -> String {
        format!(
            "{COINGECKO_API}/coins/{coin_id}?localization=false&tickers=false&market_data=false&community_data=true&developer_data=true&sparkline=false"
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Reddit,
    Telegram,
    Discord,
    Twitter,
    Github,
}

impl Platform {
    /// Platforms tracked in social links and subscriber counts.
    pub const SOCIAL: [Platform; 4] = [
        Platform::Reddit,
        Platform::Telegram,
        Platform::Discord,
        Platform::Twitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Reddit => "reddit",
            Platform::Telegram => "telegram",
            Platform::Discord => "discord",
            Platform::Twitter => "twitter",
            Platform::Github => "github",
        }
    }

    fn search_term(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram+channel",
            Platform::Discord => "discord+server",
            Platform::Twitter => "twitter",
            Platform::Reddit => "reddit",
            Platform::Github => "github",
        }
    }

    /// URL fragments identifying a link to this platform.
    pub fn url_markers(&self) -> &'static [&'static str] {
        match self {
            Platform::Telegram => &["t.me/s", "telegram.me"],
            Platform::Discord => &["discord.com/invite/", "discordapp.com/invite/"],
            Platform::Twitter => &["https://twitter.com/"],
            Platform::Reddit => &["https://www.reddit.com/r/"],
            Platform::Github => &["https://github.com/"],
        }
    }

    fn bare_root(&self) -> Option<&'static str> {
        match self {
            Platform::Reddit => Some("https://www.reddit.com"),
            Platform::Telegram => Some("https://www.telegram.com"),
            Platform::Discord => Some("https://discord.com"),
            Platform::Twitter => Some("https://twitter.com"),
            Platform::Github => None,
        }
    }
}

pub fn google_search_url(coin_id: &str, platform: Platform) -> String {
    format!(
        "https://www.google.com/search?q={coin_id}+{}",
        platform.search_term()
    )
}

/// Link data captured from a coin detail response, stored verbatim as `raw_links`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLinks {
    pub homepages: Vec<String>,
    pub github_repos: Vec<String>,
    pub subreddit: Option<String>,
    pub chat_urls: Vec<String>,
}

impl RawLinks {
    pub fn parse(serialized: &str) -> Result<Self, AdapterError> {
        if serialized.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: JsonValue = serde_json::from_str(serialized)?;
        Ok(Self {
            homepages: string_list(&value["homepage"]),
            github_repos: string_list(&value["repos_url"]["github"]),
            subreddit: value["subreddit_url"]
                .as_str()
                .and_then(|s| non_empty(s.to_string())),
            chat_urls: string_list(&value["chat_url"]),
        })
    }

    pub fn homepage(&self) -> Option<&str> {
        self.homepages.first().map(String::as_str)
    }

    /// Starting point for a platform before the homepage is consulted.
    pub fn candidate(&self, platform: Platform) -> Option<String> {
        match platform {
            Platform::Reddit => self.subreddit.clone(),
            Platform::Discord => self
                .chat_urls
                .iter()
                .find(|url| Platform::Discord.url_markers().iter().any(|m| url.contains(m)))
                .cloned(),
            Platform::Github => self.github_repos.first().cloned(),
            Platform::Telegram | Platform::Twitter => None,
        }
    }
}

fn string_list(value: &JsonValue) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .filter_map(|s| non_empty(s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn hrefs<'a>(root: impl Iterator<Item = ElementRef<'a>> + 'a) -> impl Iterator<Item = String> + 'a {
    root.filter_map(|a| a.value().attr("href"))
        .map(|href| href.to_ascii_lowercase())
}

/// First anchor on a page whose href mentions the platform.
pub fn platform_link_on_page(document: &Html, platform: Platform) -> Result<Option<String>, AdapterError> {
    let anchors = selector("a[href]")?;
    let found = hrefs(document.select(&anchors)).find(|href| href.contains(platform.as_str()));
    Ok(found)
}

/// True when the link is missing or points at the bare platform root rather than a
/// specific channel/account. Github links are never judged.
pub fn is_bare_platform_link(platform: Platform, link: &str) -> bool {
    let Some(root) = platform.bare_root() else {
        return false;
    };
    if link.trim().is_empty() {
        return true;
    }
    strip_url_noise(root).len() >= strip_url_noise(link).len()
}

fn strip_url_noise(url: &str) -> String {
    ["http://", "https://", "www.", "/"]
        .iter()
        .fold(url.to_string(), |acc, noise| acc.replace(noise, ""))
}

pub fn matches_platform(platform: Platform, href: &str) -> bool {
    platform.url_markers().iter().any(|marker| href.contains(marker))
}

pub fn normalize_platform_link(platform: Platform, url: &str) -> String {
    match platform {
        Platform::Telegram => url.replace("/s/", "/"),
        Platform::Reddit if !url.is_empty() && !url.ends_with('/') => format!("{url}/"),
        _ => url.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(String),
    NoMatch,
    /// No result container on the page, usually a captcha or consent wall.
    Unavailable,
}

pub fn search_result_link(document: &Html, platform: Platform) -> Result<SearchOutcome, AdapterError> {
    let results = selector("div#rso")?;
    let anchors = selector("a[href]")?;
    let Some(container) = document.select(&results).next() else {
        return Ok(SearchOutcome::Unavailable);
    };
    let outcome = hrefs(container.select(&anchors))
        .find(|href| matches_platform(platform, href))
        .map(SearchOutcome::Found)
        .unwrap_or(SearchOutcome::NoMatch);
    Ok(outcome)
}

pub fn reddit_about_url(subreddit_url: &str) -> String {
    let sep = if subreddit_url.ends_with('/') { "" } else { "/" };
    format!("{subreddit_url}{sep}about.json")
}

pub fn reddit_subscribers(about: &JsonValue) -> Option<i64> {
    about["data"]["subscribers"].as_i64()
}

pub fn twitter_account_name(url: &str) -> Option<String> {
    let lower = url.to_ascii_lowercase();
    let rest = ["https://twitter.com/", "https://x.com/"]
        .iter()
        .find_map(|prefix| lower.starts_with(prefix).then(|| &url[prefix.len()..]))?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    non_empty(name)
}

/// Digits (thousands separators allowed) ending right before `marker`.
fn count_before(text: &str, marker: &str) -> Option<i64> {
    text.match_indices(marker).find_map(|(idx, _)| {
        let digits: String = text[..idx]
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit() || *c == ',')
            .filter(char::is_ascii_digit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    })
}

pub fn discord_members_count(text: &str) -> Option<i64> {
    count_before(text, " members").or_else(|| count_before(text, " other members"))
}

/// Leading number of a telegram `tgme_page_extra` text such as `12 345 subscribers`.
pub fn telegram_subscriber_count(text: &str) -> Option<i64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits: String = compact.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

pub fn telegram_count_on_page(document: &Html) -> Result<Option<i64>, AdapterError> {
    let extra = selector("div.tgme_page_extra")?;
    let count = document
        .select(&extra)
        .next()
        .and_then(|div| telegram_subscriber_count(&div.text().collect::<String>()));
    Ok(count)
}

pub fn discord_count_on_page(document: &Html) -> Result<Option<i64>, AdapterError> {
    let metas = selector("meta[content]")?;
    let count = document
        .select(&metas)
        .filter_map(|meta| meta.value().attr("content"))
        .find(|content| content.contains("members"))
        .and_then(discord_members_count);
    Ok(count)
}

/// Follower lookup for platforms that need an authenticated API.
#[async_trait]
pub trait FollowerCounter: Send + Sync {
    async fn followers(&self, account: &str) -> FetchOutcome<i64>;
}

pub struct TwitterApi {
    http: Arc<HttpFetcher>,
    bearer_token: String,
}

impl TwitterApi {
    pub fn new(http: Arc<HttpFetcher>, bearer_token: impl Into<String>) -> Self {
        Self {
            http,
            bearer_token: bearer_token.into(),
        }
    }
}

#[async_trait]
impl FollowerCounter for TwitterApi {
    async fn followers(&self, account: &str) -> FetchOutcome<i64> {
        let url = format!(
            "https://api.twitter.com/2/users/by/username/{account}?user.fields=public_metrics"
        );
        match self.http.fetch_json_authorized(&url, &self.bearer_token).await {
            FetchOutcome::Success(body) => body["data"]["public_metrics"]["followers_count"]
                .as_i64()
                .map(FetchOutcome::Success)
                .unwrap_or(FetchOutcome::Empty),
            FetchOutcome::Empty => FetchOutcome::Empty,
            FetchOutcome::Failure(reason) => FetchOutcome::Failure(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_LINKS: &str = r#"{
        "homepage": ["", "https://bitcoin.org", ""],
        "telegram_channel_identifier": "",
        "subreddit_url": "https://www.reddit.com/r/Bitcoin/",
        "repos_url": {"github": ["https://github.com/bitcoin/bitcoin"]},
        "chat_url": ["https://t.me/x", "https://discord.com/invite/bitcoin"]
    }"#;

    #[test]
    fn raw_links_seed_platform_candidates() {
        let links = RawLinks::parse(RAW_LINKS).unwrap();
        assert_eq!(links.homepage(), Some("https://bitcoin.org"));
        assert_eq!(
            links.candidate(Platform::Reddit).as_deref(),
            Some("https://www.reddit.com/r/Bitcoin/")
        );
        assert_eq!(
            links.candidate(Platform::Discord).as_deref(),
            Some("https://discord.com/invite/bitcoin")
        );
        assert_eq!(
            links.candidate(Platform::Github).as_deref(),
            Some("https://github.com/bitcoin/bitcoin")
        );
        assert_eq!(links.candidate(Platform::Twitter), None);
        assert_eq!(RawLinks::parse("").unwrap(), RawLinks::default());
    }

    #[test]
    fn bare_roots_are_not_usable_links() {
        assert!(is_bare_platform_link(Platform::Twitter, "https://twitter.com/"));
        assert!(is_bare_platform_link(Platform::Reddit, "https://reddit.com"));
        assert!(is_bare_platform_link(Platform::Discord, ""));
        assert!(!is_bare_platform_link(Platform::Twitter, "https://twitter.com/bitcoin"));
        assert!(!is_bare_platform_link(Platform::Github, ""));
    }

    #[test]
    fn links_are_normalized_per_platform() {
        assert_eq!(
            normalize_platform_link(Platform::Telegram, "https://t.me/s/bitcoin"),
            "https://t.me/bitcoin"
        );
        assert_eq!(
            normalize_platform_link(Platform::Reddit, "https://www.reddit.com/r/Bitcoin"),
            "https://www.reddit.com/r/Bitcoin/"
        );
        assert_eq!(normalize_platform_link(Platform::Reddit, ""), "");
    }

    #[test]
    fn homepage_anchors_are_matched_by_platform_name() {
        let page = Html::parse_document(
            r#"<html><body>
                <a href="/about">About</a>
                <a href="https://Twitter.com/Bitcoin">Follow</a>
                <a href="https://t.me/bitcoin">Chat</a>
            </body></html>"#,
        );
        assert_eq!(
            platform_link_on_page(&page, Platform::Twitter).unwrap().as_deref(),
            Some("https://twitter.com/bitcoin")
        );
        assert_eq!(platform_link_on_page(&page, Platform::Discord).unwrap(), None);
    }

    #[test]
    fn search_results_need_the_result_container() {
        let blocked = Html::parse_document("<html><body><form id=captcha></form></body></html>");
        assert_eq!(
            search_result_link(&blocked, Platform::Reddit).unwrap(),
            SearchOutcome::Unavailable
        );

        let results = Html::parse_document(
            r#"<div id="rso">
                <a href="https://example.com/bitcoin">x</a>
                <a href="https://www.reddit.com/r/Bitcoin/">r/Bitcoin</a>
            </div>"#,
        );
        assert_eq!(
            search_result_link(&results, Platform::Reddit).unwrap(),
            SearchOutcome::Found("https://www.reddit.com/r/bitcoin/".to_string())
        );
        assert_eq!(
            search_result_link(&results, Platform::Discord).unwrap(),
            SearchOutcome::NoMatch
        );
    }

    #[test]
    fn subscriber_counts_are_read_from_pages() {
        let telegram = Html::parse_document(
            r#"<div class="tgme_page_extra">52 311 subscribers</div>"#,
        );
        assert_eq!(telegram_count_on_page(&telegram).unwrap(), Some(52311));

        let discord = Html::parse_document(
            r#"<head>
                <meta property="og:title" content="Bitcoin">
                <meta name="description" content="Check out the Bitcoin community on Discord - hang out with 12,408 other members.">
            </head>"#,
        );
        assert_eq!(discord_count_on_page(&discord).unwrap(), Some(12408));
        assert_eq!(discord_members_count("1200 members online"), Some(1200));
        assert_eq!(discord_members_count("nobody here"), None);
    }

    #[test]
    fn reddit_and_twitter_helpers() {
        assert_eq!(
            reddit_about_url("https://www.reddit.com/r/Bitcoin"),
            "https://www.reddit.com/r/Bitcoin/about.json"
        );
        let about = serde_json::json!({"data": {"subscribers": 4_900_000}});
        assert_eq!(reddit_subscribers(&about), Some(4_900_000));
        assert_eq!(
            twitter_account_name("https://twitter.com/bitcoin?lang=en").as_deref(),
            Some("bitcoin")
        );
        assert_eq!(twitter_account_name("https://example.com/bitcoin"), None);
    }

    #[test]
    fn endpoints_follow_configuration() {
        let endpoints = CoingeckoEndpoints {
            currency: "eur".into(),
            toplist_len: 100,
        };
        let url = endpoints.toplist_url();
        assert!(url.contains("vs_currency=eur"));
        assert!(url.contains("per_page=100"));
        assert!(endpoints
            .coin_detail_url("bitcoin")
            .starts_with("https://api.coingecko.com/api/v3/coins/bitcoin?"));
    }
}
