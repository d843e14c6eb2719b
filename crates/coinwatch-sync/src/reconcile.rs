//! Merges freshly normalized records into persisted state under per-kind update policies.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use coinwatch_core::{EntityKind, NormalizedRecord, PersistedRecord, RecordKey, UpdatePolicy};
use coinwatch_storage::{Persistence, StoreError, WriteBatch};
use tracing::{debug, warn};

/// Persisted records of one kind, indexed by key. Built once per pass.
pub type ExistingIndex = HashMap<RecordKey, PersistedRecord>;

pub fn index_by_key(records: Vec<PersistedRecord>) -> ExistingIndex {
    records
        .into_iter()
        .map(|record| (record.key().clone(), record))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub kind: EntityKind,
    pub to_insert: Vec<NormalizedRecord>,
    pub to_update: Vec<NormalizedRecord>,
    pub skipped: usize,
}

impl ReconcilePlan {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            to_insert: Vec::new(),
            to_update: Vec::new(),
            skipped: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty()
    }

    pub fn into_batch(self) -> WriteBatch {
        WriteBatch {
            inserts: self.to_insert,
            upserts: self.to_update,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Insert(usize),
    Update(usize),
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    policies: BTreeMap<EntityKind, UpdatePolicy>,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self {
            policies: EntityKind::ALL
                .into_iter()
                .map(|kind| (kind, kind.default_policy()))
                .collect(),
        }
    }
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, kind: EntityKind, policy: UpdatePolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    /// Base identity freshness window.
    pub fn with_base_stale_window(self, window: Duration) -> Self {
        self.with_policy(EntityKind::BaseIdentity, UpdatePolicy::OverwriteIfStale(window))
    }

    pub fn policy(&self, kind: EntityKind) -> UpdatePolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_policy())
    }

    pub fn reconcile(
        &self,
        kind: EntityKind,
        incoming: Vec<NormalizedRecord>,
        existing: &ExistingIndex,
        now: DateTime<Utc>,
    ) -> ReconcilePlan {
        let policy = self.policy(kind);
        let mut plan = ReconcilePlan::new(kind);
        let mut pending: HashMap<RecordKey, Pending> = HashMap::new();

        for record in incoming {
            if record.kind != kind {
                warn!(expected = %kind, got = %record.kind, key = %record.key, "record of another kind ignored");
                plan.skipped += 1;
                continue;
            }

            if let Some(slot) = pending.get(&record.key).copied() {
                let target = match slot {
                    Pending::Insert(idx) => &mut plan.to_insert[idx],
                    Pending::Update(idx) => &mut plan.to_update[idx],
                };
                // later duplicate: the pending record counts as written at `now`
                match merge(policy, target, now, &record, now) {
                    Some(merged) => *target = merged,
                    None => plan.skipped += 1,
                }
                continue;
            }

            match existing.get(&record.key) {
                None => {
                    pending.insert(record.key.clone(), Pending::Insert(plan.to_insert.len()));
                    plan.to_insert.push(record);
                }
                Some(stored) => match merge(policy, &stored.record, stored.last_write, &record, now) {
                    Some(merged) => {
                        pending.insert(record.key.clone(), Pending::Update(plan.to_update.len()));
                        plan.to_update.push(merged);
                    }
                    None => plan.skipped += 1,
                },
            }
        }

        debug!(
            kind = %kind,
            inserts = plan.to_insert.len(),
            updates = plan.to_update.len(),
            skipped = plan.skipped,
            "reconciled"
        );
        plan
    }

    /// Loads the persisted set for `kind` and reconciles `incoming` against it.
    pub async fn plan_against(
        &self,
        store: &dyn Persistence,
        kind: EntityKind,
        incoming: Vec<NormalizedRecord>,
        now: DateTime<Utc>,
    ) -> Result<ReconcilePlan, StoreError> {
        let existing = index_by_key(store.get_all(kind).await?);
        Ok(self.reconcile(kind, incoming, &existing, now))
    }
}

/// Candidate natural keys with no persisted record yet, in candidate order without repeats.
pub fn new_keys<I, S>(candidates: I, existing: &ExistingIndex) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let known: HashSet<&str> = existing.keys().map(RecordKey::natural).collect();
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(Into::into)
        .filter(|key| !known.contains(key.as_str()) && seen.insert(key.clone()))
        .collect()
}

fn merge(
    policy: UpdatePolicy,
    current: &NormalizedRecord,
    last_write: DateTime<Utc>,
    incoming: &NormalizedRecord,
    now: DateTime<Utc>,
) -> Option<NormalizedRecord> {
    match policy {
        UpdatePolicy::AlwaysOverwrite => Some(overlay(current, incoming)),
        UpdatePolicy::OverwriteIfStale(window) => {
            (now - last_write > window).then(|| overlay(current, incoming))
        }
        UpdatePolicy::SetOnceIfEmpty => {
            let mut merged = current.clone();
            let mut changed = false;
            for (name, value) in &incoming.fields {
                if value.is_empty() {
                    continue;
                }
                let slot_empty = merged.fields.get(name).map_or(true, |v| v.is_empty());
                if slot_empty {
                    merged.fields.insert(name.clone(), value.clone());
                    changed = true;
                }
            }
            changed.then_some(merged)
        }
        UpdatePolicy::InsertIfAbsent => None,
    }
}

fn overlay(current: &NormalizedRecord, incoming: &NormalizedRecord) -> NormalizedRecord {
    let mut merged = current.clone();
    merged
        .fields
        .extend(incoming.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
