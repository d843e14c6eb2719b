//! Persistence capability and the in-memory backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use coinwatch_core::{EntityKind, NormalizedRecord, PersistedRecord, RecordKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} record `{key}` already exists")]
    Duplicate { kind: EntityKind, key: String },
    #[error("key `{key}` does not fit {kind} storage")]
    KeyShape { kind: EntityKind, key: String },
    #[error("malformed stored row: {0}")]
    Malformed(String),
    #[error("memory store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// History rows observed on the day, or records last written on it.
    WrittenOn(NaiveDate),
    NaturalKeys(BTreeSet<String>),
}

impl RecordFilter {
    pub fn matches(&self, record: &PersistedRecord) -> bool {
        match self {
            RecordFilter::WrittenOn(day) => match record.key() {
                RecordKey::Dated { date, .. } => date == day,
                RecordKey::Natural(_) => record.last_write.date_naive() == *day,
            },
            RecordFilter::NaturalKeys(keys) => keys.contains(record.key().natural()),
        }
    }
}

/// Writes of one reconciliation pass. Committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    /// Must not exist yet; an existing key fails the whole batch.
    pub inserts: Vec<NormalizedRecord>,
    /// Replace the stored record, or create it.
    pub upserts: Vec<NormalizedRecord>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: NormalizedRecord) {
        self.inserts.push(record);
    }

    pub fn upsert(&mut self, record: NormalizedRecord) {
        self.upserts.push(record);
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.inserts.extend(other.inserts);
        self.upserts.extend(other.upserts);
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.upserts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub upserted: usize,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_all(&self, kind: EntityKind) -> Result<Vec<PersistedRecord>, StoreError>;

    async fn get_filtered(
        &self,
        kind: EntityKind,
        filter: &RecordFilter,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        Ok(self
            .get_all(kind)
            .await?
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect())
    }

    /// Applies every write in `batch` stamped with `written_at`, or none of them.
    async fn commit(
        &self,
        batch: WriteBatch,
        written_at: DateTime<Utc>,
    ) -> Result<CommitSummary, StoreError>;

    async fn upsert(
        &self,
        records: Vec<NormalizedRecord>,
        written_at: DateTime<Utc>,
    ) -> Result<CommitSummary, StoreError> {
        let batch = WriteBatch {
            inserts: Vec::new(),
            upserts: records,
        };
        self.commit(batch, written_at).await
    }

    async fn insert(
        &self,
        records: Vec<NormalizedRecord>,
        written_at: DateTime<Utc>,
    ) -> Result<CommitSummary, StoreError> {
        let batch = WriteBatch {
            inserts: records,
            upserts: Vec::new(),
        };
        self.commit(batch, written_at).await
    }
}

pub(crate) fn check_key_shape(record: &NormalizedRecord) -> Result<(), StoreError> {
    let dated = matches!(record.key, RecordKey::Dated { .. });
    if dated == record.kind.is_append_only() {
        Ok(())
    } else {
        Err(StoreError::KeyShape {
            kind: record.kind,
            key: record.key.to_string(),
        })
    }
}

type Slot = (EntityKind, RecordKey);

/// Process-local backend. Commits stage a copy of the table and swap it in on success.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<Slot, PersistedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<MutexGuard<'_, BTreeMap<Slot, PersistedRecord>>, StoreError> {
        self.rows.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.snapshot(kind).len()
    }

    pub fn snapshot(&self, kind: EntityKind) -> Vec<PersistedRecord> {
        self.rows()
            .map(|rows| {
                rows.iter()
                    .filter(|((k, _), _)| *k == kind)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get_all(&self, kind: EntityKind) -> Result<Vec<PersistedRecord>, StoreError> {
        let rows = self.rows()?;
        Ok(rows
            .range((kind, RecordKey::Natural(String::new()))..)
            .take_while(|((k, _), _)| *k == kind)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn commit(
        &self,
        batch: WriteBatch,
        written_at: DateTime<Utc>,
    ) -> Result<CommitSummary, StoreError> {
        let mut rows = self.rows()?;
        let mut staged = rows.clone();
        let mut summary = CommitSummary::default();

        for record in batch.inserts {
            check_key_shape(&record)?;
            let slot = (record.kind, record.key.clone());
            if staged.contains_key(&slot) {
                return Err(StoreError::Duplicate {
                    kind: record.kind,
                    key: record.key.to_string(),
                });
            }
            staged.insert(
                slot,
                PersistedRecord {
                    record,
                    last_write: written_at,
                },
            );
            summary.inserted += 1;
        }

        for record in batch.upserts {
            check_key_shape(&record)?;
            staged.insert(
                (record.kind, record.key.clone()),
                PersistedRecord {
                    record,
                    last_write: written_at,
                },
            );
            summary.upserted += 1;
        }

        *rows = staged;
        Ok(summary)
    }
}
