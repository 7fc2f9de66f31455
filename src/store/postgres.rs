//! Postgres-backed store (sqlx). Schema lives in [`crate::util::db`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use super::{EntityStore, RecordQuery, RecordStore, Result, StoreError};
use crate::pipeline::model::{BatchKey, Entity, EntityPatch, PartitionKey, PersistedRecord};
use crate::util::db::Db;

// 6 binds per row; stay well below the 65535 bind limit.
const INSERT_CHUNK: usize = 5_000;

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn map_write_error(err: sqlx::Error, what: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::DuplicateKey(format!("{what}: {}", db_err.message()))
        }
        _ => StoreError::Sqlx(err),
    }
}

fn ordinal_column(partition: &PartitionKey) -> Option<i64> {
    partition.ordinal().and_then(|v| i64::try_from(v).ok())
}

fn decode_record(row: &PgRow) -> Result<PersistedRecord> {
    let date: NaiveDate = row.try_get("batch_date")?;
    let kind: String = row.try_get("batch_kind")?;
    let partition: String = row.try_get("partition_key")?;
    let payload: Value = row.try_get("payload")?;
    Ok(PersistedRecord::new(
        BatchKey::new(date, kind),
        PartitionKey::from_storage(&partition)?,
        payload,
    ))
}

fn decode_entity(row: &PgRow) -> Result<Entity> {
    let status: String = row.try_get("status")?;
    let attrs: Value = row.try_get("attrs")?;
    let history: Value = row.try_get("history")?;
    let attrs: BTreeMap<String, String> = serde_json::from_value(attrs)
        .map_err(|e| StoreError::Decode(format!("entity attrs: {e}")))?;
    let history: BTreeMap<String, Vec<String>> = serde_json::from_value(history)
        .map_err(|e| StoreError::Decode(format!("entity history: {e}")))?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(Entity {
        kind: row.try_get("kind")?,
        key: row.try_get("entity_key")?,
        external_id: row.try_get("external_id")?,
        status: status.parse()?,
        attrs,
        history,
        updated_at,
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

#[async_trait]
impl RecordStore for PgStore {
    #[instrument(skip(self, records), fields(rows = records.len()))]
    async fn insert_many(&self, collection: &str, records: &[PersistedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.pool.begin().await?;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO collected_records (collection, batch_date, batch_kind, partition_key, partition_ordinal, payload) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(collection)
                    .push_bind(r.key.date)
                    .push_bind(r.key.kind.as_str())
                    .push_bind(r.partition.to_storage())
                    .push_bind(ordinal_column(&r.partition))
                    .push_bind(&r.payload);
            });
            qb.build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_write_error(e, collection))?;
        }
        tx.commit().await?;
        debug!(collection, rows = records.len(), "committed batch");
        Ok(())
    }

    async fn count_by_key(&self, collection: &str, key: &BatchKey) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::BIGINT FROM collected_records WHERE collection = $1 AND batch_date = $2 AND batch_kind = $3",
        )
        .persistent(false)
        .bind(collection)
        .bind(key.date)
        .bind(key.kind.as_str())
        .fetch_one(&self.db.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn find_one(
        &self,
        collection: &str,
        query: &RecordQuery,
    ) -> Result<Option<PersistedRecord>> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT batch_date, batch_kind, partition_key, payload FROM collected_records WHERE collection = ",
        );
        qb.push_bind(collection);
        if let Some(key) = &query.key {
            qb.push(" AND batch_date = ").push_bind(key.date);
            qb.push(" AND batch_kind = ").push_bind(key.kind.clone());
        }
        if let Some(kind) = &query.kind {
            qb.push(" AND batch_kind = ").push_bind(kind.clone());
        }
        if let Some(partition) = &query.partition {
            qb.push(" AND partition_key = ").push_bind(partition.to_storage());
        }
        qb.push(" ORDER BY partition_ordinal DESC NULLS LAST, seq DESC LIMIT 1");

        let row = qb.build().persistent(false).fetch_optional(&self.db.pool).await?;
        row.as_ref().map(decode_record).transpose()
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn get_entity(&self, kind: &str, key: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT kind, entity_key, external_id, status, attrs, history, updated_at FROM reconciled_entities WHERE kind = $1 AND entity_key = $2",
        )
        .persistent(false)
        .bind(kind)
        .bind(key)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(decode_entity).transpose()
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        sqlx::query(
            "INSERT INTO reconciled_entities (kind, entity_key, external_id, status, attrs, history, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .persistent(false)
        .bind(&entity.kind)
        .bind(&entity.key)
        .bind(entity.external_id)
        .bind(entity.status.as_str())
        .bind(encode_json(&entity.attrs)?)
        .bind(encode_json(&entity.history)?)
        .bind(entity.updated_at)
        .execute(&self.db.pool)
        .await
        .map_err(|e| map_write_error(e, &format!("{}/{}", entity.kind, entity.key)))?;
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn update_entity(&self, kind: &str, key: &str, patch: &EntityPatch) -> Result<()> {
        let mut tx = self.db.pool.begin().await?;
        let row = sqlx::query(
            "SELECT kind, entity_key, external_id, status, attrs, history, updated_at FROM reconciled_entities WHERE kind = $1 AND entity_key = $2 FOR UPDATE",
        )
        .persistent(false)
        .bind(kind)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("{kind}/{key}")))?;

        let mut entity = decode_entity(&row)?;
        entity.apply(patch);

        sqlx::query(
            "UPDATE reconciled_entities SET external_id = $3, status = $4, attrs = $5, history = $6, updated_at = $7 WHERE kind = $1 AND entity_key = $2",
        )
        .persistent(false)
        .bind(kind)
        .bind(key)
        .bind(entity.external_id)
        .bind(entity.status.as_str())
        .bind(encode_json(&entity.attrs)?)
        .bind(encode_json(&entity.history)?)
        .bind(entity.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
