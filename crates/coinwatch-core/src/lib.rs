//! Core record model shared by the collectors, the reconciliation engine and storage.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "coinwatch-core";

/// Canonical name of the natural-key field carried by every normalized record.
pub const NATURAL_KEY_FIELD: &str = "coin_id";

/// Kinds of persisted entities. Each kind has exactly one update policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Stablecoin,
    BaseIdentity,
    Classification,
    VolatileMetric,
    Rating,
    RawLinks,
    Homepage,
    SocialLinks,
    SubscriberCount,
    Trend,
}

impl EntityKind {
    pub const ALL: [EntityKind; 10] = [
        EntityKind::Stablecoin,
        EntityKind::BaseIdentity,
        EntityKind::Classification,
        EntityKind::VolatileMetric,
        EntityKind::Rating,
        EntityKind::RawLinks,
        EntityKind::Homepage,
        EntityKind::SocialLinks,
        EntityKind::SubscriberCount,
        EntityKind::Trend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Stablecoin => "stablecoin",
            EntityKind::BaseIdentity => "base_identity",
            EntityKind::Classification => "classification",
            EntityKind::VolatileMetric => "volatile_metric",
            EntityKind::Rating => "rating",
            EntityKind::RawLinks => "raw_links",
            EntityKind::Homepage => "homepage",
            EntityKind::SocialLinks => "social_links",
            EntityKind::SubscriberCount => "subscriber_count",
            EntityKind::Trend => "trend",
        }
    }

    pub fn default_policy(&self) -> UpdatePolicy {
        match self {
            EntityKind::Stablecoin
            | EntityKind::RawLinks
            | EntityKind::Homepage
            | EntityKind::SocialLinks
            | EntityKind::SubscriberCount => UpdatePolicy::InsertIfAbsent,
            EntityKind::BaseIdentity => UpdatePolicy::OverwriteIfStale(Duration::days(14)),
            EntityKind::Classification => UpdatePolicy::SetOnceIfEmpty,
            EntityKind::VolatileMetric | EntityKind::Rating | EntityKind::Trend => {
                UpdatePolicy::AlwaysOverwrite
            }
        }
    }

    /// Append-only kinds are keyed by natural key + platform + date rather than natural key alone.
    pub fn is_append_only(&self) -> bool {
        matches!(self, EntityKind::SubscriberCount)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEntityKind(pub String);

impl fmt::Display for UnknownEntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown entity kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownEntityKind {}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEntityKind(s.to_string()))
    }
}

/// How an incoming record is merged into an already persisted one with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    AlwaysOverwrite,
    /// Overwrite only once the persisted record is older than the window.
    OverwriteIfStale(Duration),
    /// Fill fields that are currently empty; never touch populated ones.
    SetOnceIfEmpty,
    InsertIfAbsent,
}

/// Scalar stored in a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Identity of a record within its entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKey {
    Natural(String),
    /// Append-only history row: one per natural key, platform and day.
    Dated {
        natural: String,
        platform: String,
        date: NaiveDate,
    },
}

impl RecordKey {
    pub fn natural(&self) -> &str {
        match self {
            RecordKey::Natural(key) => key,
            RecordKey::Dated { natural, .. } => natural,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Natural(key) => f.write_str(key),
            RecordKey::Dated {
                natural,
                platform,
                date,
            } => write!(f, "{natural}-{platform}-{}", date.format("%Y-%m-%d")),
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Canonical record produced by normalization and consumed by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub kind: EntityKind,
    pub key: RecordKey,
    pub fields: Fields,
}

impl NormalizedRecord {
    pub fn new(kind: EntityKind, key: RecordKey) -> Self {
        Self {
            kind,
            key,
            fields: Fields::new(),
        }
    }

    /// Record keyed by `natural`, with the natural-key field already populated.
    pub fn natural(kind: EntityKind, natural: impl Into<String>) -> Self {
        let natural = natural.into();
        let mut record = Self::new(kind, RecordKey::Natural(natural.clone()));
        record
            .fields
            .insert(NATURAL_KEY_FIELD.to_string(), FieldValue::Text(natural));
        record
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }
}

/// A normalized record as it sits in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub record: NormalizedRecord,
    pub last_write: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn kind(&self) -> EntityKind {
        self.record.kind
    }

    pub fn key(&self) -> &RecordKey {
        &self.record.key
    }
}

/// Result of a single remote fetch or scrape. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Success(T),
    Empty,
    Failure(String),
}

impl<T> FetchOutcome<T> {
    pub fn success(self) -> Option<T> {
        match self {
            FetchOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to simulate hours and days.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
