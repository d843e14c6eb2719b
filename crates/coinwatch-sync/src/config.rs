use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use coinwatch_adapters::CoingeckoEndpoints;
use coinwatch_storage::{HeaderProfile, HttpClientConfig};
use serde::Deserialize;
use tokio::fs;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub database_url: Option<String>,
    pub cycle: Duration,
    pub retry: RetryPolicy,
    pub base_stale_days: i64,
    pub headers: HeaderProfile,
    pub http_timeout_secs: u64,
    pub request_spacing: Duration,
    pub detail_spacing: Duration,
    pub extended_batch: usize,
    pub toplist_len: u32,
    pub currency: String,
    pub twitter_bearer_token: Option<String>,
    pub routines_file: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());
        let non_blank = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        Self {
            database_url: non_blank("DATABASE_URL"),
            cycle: Duration::from_secs(parsed("COINWATCH_CYCLE_SECS").unwrap_or(360)),
            retry: RetryPolicy::new(
                parse_or(var("COINWATCH_RETRY_ATTEMPTS"), 4),
                Duration::from_secs(parsed("COINWATCH_RETRY_TIMEOUT_SECS").unwrap_or(20)),
            ),
            base_stale_days: parse_or(var("COINWATCH_BASE_STALE_DAYS"), 14),
            headers: header_profile(&var),
            http_timeout_secs: parsed("COINWATCH_HTTP_TIMEOUT_SECS").unwrap_or(20),
            request_spacing: Duration::from_millis(
                parsed("COINWATCH_REQUEST_SPACING_MS").unwrap_or(1000),
            ),
            detail_spacing: Duration::from_secs(parsed("COINWATCH_DETAIL_SPACING_SECS").unwrap_or(7)),
            extended_batch: parse_or(var("COINWATCH_EXTENDED_BATCH"), 10),
            toplist_len: parse_or(var("COINWATCH_TOPLIST_LEN"), 250),
            currency: var("COINWATCH_CURRENCY").unwrap_or_else(|| "usd".to_string()),
            twitter_bearer_token: non_blank("TWITTER_BEARER_TOKEN"),
            routines_file: non_blank("COINWATCH_ROUTINES_FILE").map(PathBuf::from),
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            headers: self.headers.clone(),
            request_spacing: self.request_spacing,
        }
    }

    pub fn endpoints(&self) -> CoingeckoEndpoints {
        CoingeckoEndpoints {
            currency: self.currency.clone(),
            toplist_len: self.toplist_len,
        }
    }

    pub fn base_stale_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.base_stale_days)
    }

    /// Routine overrides from `COINWATCH_ROUTINES_FILE`, or none when unset.
    pub async fn load_routine_registry(&self) -> Result<RoutineRegistry> {
        match &self.routines_file {
            Some(path) => RoutineRegistry::load(path).await,
            None => Ok(RoutineRegistry::default()),
        }
    }
}

/// A pinned `COINWATCH_USER_AGENT` replaces the rotation list. Referers are comma separated.
fn header_profile(var: &impl Fn(&str) -> Option<String>) -> HeaderProfile {
    let defaults = HeaderProfile::default();
    let user_agents = var("COINWATCH_USER_AGENT")
        .map(|agent| agent.trim().to_string())
        .filter(|agent| !agent.is_empty())
        .map(|agent| vec![agent])
        .unwrap_or(defaults.user_agents);
    let referers = var("COINWATCH_REFERERS")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|list| !list.is_empty())
        .unwrap_or(defaults.referers);
    let accept_language = var("COINWATCH_ACCEPT_LANGUAGE")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.accept_language);

    HeaderProfile {
        user_agents,
        referers,
        accept_language,
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutineRegistry {
    #[serde(default)]
    pub routines: Vec<RoutineOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutineOverride {
    pub name: String,
    #[serde(default)]
    pub interval_hours: Option<i64>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl RoutineRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Option<&RoutineOverride> {
        self.routines.iter().find(|r| r.name == name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).map_or(true, |r| r.enabled)
    }

    pub fn interval_for(&self, name: &str, default: chrono::Duration) -> chrono::Duration {
        self.get(name)
            .and_then(|r| r.interval_hours)
            .filter(|hours| *hours > 0)
            .map(chrono::Duration::hours)
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = CollectorConfig::default();
        assert_eq!(config.database_url, None);
        assert_eq!(config.cycle, Duration::from_secs(360));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.base_stale_window(), chrono::Duration::days(14));
        assert_eq!(config.extended_batch, 10);
        assert_eq!(config.endpoints(), CoingeckoEndpoints::default());
    }

    #[test]
    fn lookup_values_override_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://coinwatch@localhost/coinwatch"),
            ("COINWATCH_RETRY_ATTEMPTS", "2"),
            ("COINWATCH_BASE_STALE_DAYS", "7"),
            ("COINWATCH_CURRENCY", "eur"),
            ("COINWATCH_TOPLIST_LEN", "not-a-number"),
            ("TWITTER_BEARER_TOKEN", "  "),
        ]);
        let config = CollectorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://coinwatch@localhost/coinwatch"));
        assert_eq!(config.retry.attempts, 2);
        assert_eq!(config.base_stale_days, 7);
        assert_eq!(config.currency, "eur");
        assert_eq!(config.toplist_len, 250);
        assert_eq!(config.twitter_bearer_token, None);
    }

    #[test]
    fn browser_headers_rotate_unless_pinned() {
        let defaults = CollectorConfig::default().http_client().headers;
        assert_eq!(defaults, HeaderProfile::default());
        assert!(defaults.user_agents.len() > 1);
        assert!(defaults.referers.contains(&"https://www.duckduckgo.com".to_string()));

        let vars: HashMap<&str, &str> = HashMap::from([
            ("COINWATCH_USER_AGENT", "Mozilla/5.0 (X11; Linux x86_64) Firefox/125.0"),
            ("COINWATCH_REFERERS", "https://www.bing.com, ,https://www.google.com"),
            ("COINWATCH_ACCEPT_LANGUAGE", "de-DE,de;q=0.8"),
        ]);
        let headers = CollectorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
            .http_client()
            .headers;
        assert_eq!(headers.user_agents, vec!["Mozilla/5.0 (X11; Linux x86_64) Firefox/125.0"]);
        assert_eq!(headers.referers, vec!["https://www.bing.com", "https://www.google.com"]);
        assert_eq!(headers.accept_language, "de-DE,de;q=0.8");
    }

    #[tokio::test]
    async fn routine_registry_loads_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "routines:\n  - name: toplist\n    interval_hours: 2\n  - name: subscriber_trends\n    enabled: false"
        )
        .unwrap();

        let registry = RoutineRegistry::load(file.path()).await.unwrap();
        assert_eq!(registry.interval_for("toplist", chrono::Duration::hours(1)), chrono::Duration::hours(2));
        assert!(registry.is_enabled("toplist"));
        assert!(!registry.is_enabled("subscriber_trends"));
        assert!(registry.is_enabled("stablecoins"));
        assert_eq!(
            registry.interval_for("stablecoins", chrono::Duration::hours(72)),
            chrono::Duration::hours(72)
        );
    }

    #[tokio::test]
    async fn unreadable_registry_reports_the_path() {
        let err = RoutineRegistry::load(Path::new("/nonexistent/routines.yaml"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/routines.yaml"));
    }
}
