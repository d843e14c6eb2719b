//! Postgres backend. One transaction per commit; dropping it unfinished rolls back.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use coinwatch_core::{EntityKind, Fields, NormalizedRecord, PersistedRecord, RecordKey};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::store::{check_key_shape, CommitSummary, Persistence, RecordFilter, StoreError, WriteBatch};

type RecordRow = (String, Json<Fields>, DateTime<Utc>);
type HistoryRow = (String, String, NaiveDate, Json<Fields>, DateTime<Utc>);

const RECORD_COLUMNS: &str = "natural_key, fields, last_write";
const HISTORY_COLUMNS: &str = "natural_key, platform, observed_on, fields, last_write";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_records(
        &self,
        kind: EntityKind,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        let rows: Vec<RecordRow> = match filter {
            None => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE entity_kind = $1 ORDER BY natural_key"
                );
                sqlx::query_as(&sql)
                    .bind(kind.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(RecordFilter::WrittenOn(day)) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE entity_kind = $1 AND (last_write AT TIME ZONE 'UTC')::date = $2
                     ORDER BY natural_key"
                );
                sqlx::query_as(&sql)
                    .bind(kind.as_str())
                    .bind(*day)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(RecordFilter::NaturalKeys(keys)) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE entity_kind = $1 AND natural_key = ANY($2)
                     ORDER BY natural_key"
                );
                sqlx::query_as(&sql)
                    .bind(kind.as_str())
                    .bind(keys.iter().cloned().collect::<Vec<_>>())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(natural_key, fields, last_write)| PersistedRecord {
                record: NormalizedRecord {
                    kind,
                    key: RecordKey::Natural(natural_key),
                    fields: fields.0,
                },
                last_write,
            })
            .collect())
    }

    async fn fetch_history(
        &self,
        kind: EntityKind,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        let order = "ORDER BY natural_key, platform, observed_on";
        let rows: Vec<HistoryRow> = match filter {
            None => {
                let sql = format!("SELECT {HISTORY_COLUMNS} FROM subscriber_counts {order}");
                sqlx::query_as(&sql).fetch_all(&self.pool).await?
            }
            Some(RecordFilter::WrittenOn(day)) => {
                let sql = format!(
                    "SELECT {HISTORY_COLUMNS} FROM subscriber_counts WHERE observed_on = $1 {order}"
                );
                sqlx::query_as(&sql).bind(*day).fetch_all(&self.pool).await?
            }
            Some(RecordFilter::NaturalKeys(keys)) => {
                let sql = format!(
                    "SELECT {HISTORY_COLUMNS} FROM subscriber_counts WHERE natural_key = ANY($1) {order}"
                );
                sqlx::query_as(&sql)
                    .bind(keys.iter().cloned().collect::<Vec<_>>())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(natural, platform, date, fields, last_write)| PersistedRecord {
                record: NormalizedRecord {
                    kind,
                    key: RecordKey::Dated {
                        natural,
                        platform,
                        date,
                    },
                    fields: fields.0,
                },
                last_write,
            })
            .collect())
    }
}

async fn write_row(
    tx: &mut Transaction<'_, Postgres>,
    record: &NormalizedRecord,
    written_at: DateTime<Utc>,
    replace: bool,
) -> Result<(), StoreError> {
    check_key_shape(record)?;

    let result = match &record.key {
        RecordKey::Natural(natural_key) => {
            let sql = if replace {
                "INSERT INTO records (entity_kind, natural_key, fields, last_write)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (entity_kind, natural_key)
                 DO UPDATE SET fields = EXCLUDED.fields, last_write = EXCLUDED.last_write"
            } else {
                "INSERT INTO records (entity_kind, natural_key, fields, last_write)
                 VALUES ($1, $2, $3, $4)"
            };
            sqlx::query(sql)
                .bind(record.kind.as_str())
                .bind(natural_key)
                .bind(Json(&record.fields))
                .bind(written_at)
                .execute(&mut **tx)
                .await
        }
        RecordKey::Dated {
            natural,
            platform,
            date,
        } => {
            let sql = if replace {
                "INSERT INTO subscriber_counts (natural_key, platform, observed_on, fields, last_write)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (natural_key, platform, observed_on)
                 DO UPDATE SET fields = EXCLUDED.fields, last_write = EXCLUDED.last_write"
            } else {
                "INSERT INTO subscriber_counts (natural_key, platform, observed_on, fields, last_write)
                 VALUES ($1, $2, $3, $4, $5)"
            };
            sqlx::query(sql)
                .bind(natural)
                .bind(platform)
                .bind(*date)
                .bind(Json(&record.fields))
                .bind(written_at)
                .execute(&mut **tx)
                .await
        }
    };

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Duplicate {
            kind: record.kind,
            key: record.key.to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl Persistence for PgStore {
    async fn get_all(&self, kind: EntityKind) -> Result<Vec<PersistedRecord>, StoreError> {
        if kind.is_append_only() {
            self.fetch_history(kind, None).await
        } else {
            self.fetch_records(kind, None).await
        }
    }

    async fn get_filtered(
        &self,
        kind: EntityKind,
        filter: &RecordFilter,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        if kind.is_append_only() {
            self.fetch_history(kind, Some(filter)).await
        } else {
            self.fetch_records(kind, Some(filter)).await
        }
    }

    async fn commit(
        &self,
        batch: WriteBatch,
        written_at: DateTime<Utc>,
    ) -> Result<CommitSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut summary = CommitSummary::default();

        for record in &batch.inserts {
            write_row(&mut tx, record, written_at, false).await?;
            summary.inserted += 1;
        }
        for record in &batch.upserts {
            write_row(&mut tx, record, written_at, true).await?;
            summary.upserted += 1;
        }

        tx.commit().await?;
        debug!(inserted = summary.inserted, upserted = summary.upserted, "committed batch");
        Ok(summary)
    }
}
