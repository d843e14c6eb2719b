//! CoinGecko market routines: stablecoin set, toplist and per-coin detail enrichment.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use coinwatch_adapters::{
    BASE_IDENTITY_FIELDS, CLASSIFICATION_FIELDS, EXTENDED_FIELDS, EXTENDED_NESTED_FIELDS,
    RAW_LINK_FIELDS, STABLECOIN_FIELDS, TOPLIST_FIELDS,
};
use coinwatch_core::{EntityKind, FetchOutcome, FieldValue};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::{saved_message, ServiceContext};
use crate::normalize::{take_kind, Normalization, ShapeMap};
use crate::routine::{RoutineError, RoutineWork, WorkOutcome};

fn payload_or_retry(outcome: FetchOutcome<JsonValue>, what: &str) -> Result<JsonValue, WorkOutcome> {
    match outcome {
        FetchOutcome::Success(payload) => Ok(payload),
        FetchOutcome::Empty => Err(WorkOutcome::Retry(format!("empty {what}"))),
        FetchOutcome::Failure(reason) => Err(WorkOutcome::Retry(reason)),
    }
}

pub struct Stablecoins {
    ctx: ServiceContext,
}

impl Stablecoins {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RoutineWork for Stablecoins {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError> {
        let ctx = &self.ctx;
        let url = ctx.endpoints.stablecoins_url();
        let payload = match payload_or_retry(ctx.fetch_json(&url).await?, "stablecoin list") {
            Ok(payload) => payload,
            Err(retry) => return Ok(retry),
        };

        let normalization = Normalization {
            allow: STABLECOIN_FIELDS,
            nested: &[],
            shapes: ShapeMap::whole(EntityKind::Stablecoin),
        };
        let records = normalization.payload(&payload);
        if records.is_empty() {
            return Ok(WorkOutcome::Retry("stablecoin list had no ids".into()));
        }

        let now = ctx.now();
        let plan = ctx
            .engine
            .plan_against(ctx.store.as_ref(), EntityKind::Stablecoin, records, now)
            .await?;
        let summary = ctx.commit(vec![plan], now).await?;
        Ok(WorkOutcome::Completed(saved_message(summary)))
    }
}

pub struct Toplist {
    ctx: ServiceContext,
}

impl Toplist {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RoutineWork for Toplist {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError> {
        let ctx = &self.ctx;
        let url = ctx.endpoints.toplist_url();
        let payload = match payload_or_retry(ctx.fetch_json(&url).await?, "toplist") {
            Ok(payload) => payload,
            Err(retry) => return Ok(retry),
        };

        let stablecoins: HashSet<String> = ctx
            .store
            .get_all(EntityKind::Stablecoin)
            .await?
            .into_iter()
            .map(|record| record.key().natural().to_string())
            .collect();

        let normalization = Normalization {
            allow: TOPLIST_FIELDS,
            nested: &[],
            shapes: ShapeMap::new()
                .shape(EntityKind::BaseIdentity, BASE_IDENTITY_FIELDS)
                .remainder(EntityKind::VolatileMetric),
        };
        let mut records: Vec<_> = normalization
            .payload(&payload)
            .into_iter()
            .filter(|record| !stablecoins.contains(record.key.natural()))
            .collect();
        if records.is_empty() {
            return Ok(WorkOutcome::Retry("toplist had no usable rows".into()));
        }

        let base = take_kind(&mut records, EntityKind::BaseIdentity);
        let now = ctx.now();
        let store = ctx.store.as_ref();
        let plans = vec![
            ctx.engine.plan_against(store, EntityKind::BaseIdentity, base, now).await?,
            ctx.engine.plan_against(store, EntityKind::VolatileMetric, records, now).await?,
        ];
        let summary = ctx.commit(plans, now).await?;
        Ok(WorkOutcome::Completed(saved_message(summary)))
    }
}

/// Detail enrichment for the highest-ranked known coins. All keys or nothing.
pub struct ExtendedToplist {
    ctx: ServiceContext,
}

impl ExtendedToplist {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Known coins ordered by market cap rank; unranked coins go last.
    async fn candidate_keys(&self) -> Result<Vec<String>, RoutineError> {
        let store = self.ctx.store.as_ref();
        let ranks: HashMap<String, i64> = store
            .get_all(EntityKind::VolatileMetric)
            .await?
            .into_iter()
            .filter_map(|p| {
                let rank = p.record.get("market_cap_rank").and_then(FieldValue::as_i64)?;
                Some((p.key().natural().to_string(), rank))
            })
            .collect();

        let mut keys: Vec<String> = store
            .get_all(EntityKind::BaseIdentity)
            .await?
            .into_iter()
            .map(|p| p.key().natural().to_string())
            .collect();
        keys.sort_by(|a, b| {
            let rank = |k: &String| ranks.get(k).copied().unwrap_or(i64::MAX);
            rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
        });
        keys.truncate(self.ctx.extended_batch);
        Ok(keys)
    }

    async fn fetch_detail(&self, coin_id: &str) -> Result<Option<JsonValue>, RoutineError> {
        let url = self.ctx.endpoints.coin_detail_url(coin_id);
        for attempt in 1..=self.ctx.key_attempts.max(1) {
            match self.ctx.fetch_json(&url).await? {
                FetchOutcome::Success(detail) => return Ok(Some(detail)),
                FetchOutcome::Empty => debug!(coin_id, attempt, "empty coin detail"),
                FetchOutcome::Failure(reason) => debug!(coin_id, attempt, %reason, "coin detail failed"),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RoutineWork for ExtendedToplist {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError> {
        let ctx = &self.ctx;
        let keys = self.candidate_keys().await?;
        if keys.is_empty() {
            return Ok(WorkOutcome::Completed(Some("no known coins to enrich".into())));
        }

        let mut details = Vec::with_capacity(keys.len());
        for (idx, coin_id) in keys.iter().enumerate() {
            match self.fetch_detail(coin_id).await? {
                Some(detail) => details.push(detail),
                None => {
                    warn!(coin_id, "coin detail unavailable, dropping the whole batch");
                    return Ok(WorkOutcome::Insufficient);
                }
            }
            if idx + 1 < keys.len() {
                tokio::time::sleep(ctx.detail_spacing).await;
            }
        }
        info!(coins = details.len(), "coin details fetched");

        let normalization = Normalization {
            allow: EXTENDED_FIELDS,
            nested: EXTENDED_NESTED_FIELDS,
            shapes: ShapeMap::new()
                .shape(EntityKind::Classification, CLASSIFICATION_FIELDS)
                .shape(EntityKind::RawLinks, RAW_LINK_FIELDS)
                .remainder(EntityKind::Rating),
        };
        let mut records: Vec<_> = details
            .iter()
            .flat_map(|detail| normalization.payload(detail))
            .collect();

        let now = ctx.now();
        let store = ctx.store.as_ref();
        let mut plans = Vec::new();
        for kind in [EntityKind::Classification, EntityKind::RawLinks, EntityKind::Rating] {
            let incoming = take_kind(&mut records, kind);
            plans.push(ctx.engine.plan_against(store, kind, incoming, now).await?);
        }
        let summary = ctx.commit(plans, now).await?;
        Ok(WorkOutcome::Completed(saved_message(summary)))
    }
}
