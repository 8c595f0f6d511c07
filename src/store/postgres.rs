//! Postgres-backed stores.
//!
//! Units are persisted as one jsonb document per row, alongside a few
//! indexed columns (stage, modified, cold flag, auto-resume time) that the
//! sweep queries filter on. The version column carries the optimistic
//! token; the document is the source of truth for everything else.
//!
//! Join entries use single-statement compare-and-set updates so the lock
//! semantics hold across independent processes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::join::{JoinDefinition, JoinEntry, JoinEntryDid};
use crate::types::{ActionState, DeltaFile, Stage};

use super::{JoinStore, StoreError, StoreResult, UnitStore};

fn stage_str(stage: Stage) -> &'static str {
    match stage {
        Stage::Ingress => "INGRESS",
        Stage::Enrich => "ENRICH",
        Stage::Egress => "EGRESS",
        Stage::Complete => "COMPLETE",
        Stage::Error => "ERROR",
        Stage::Cancelled => "CANCELLED",
    }
}

pub struct PostgresUnitStore {
    pool: PgPool,
}

impl PostgresUnitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delta_files (
                did UUID PRIMARY KEY,
                version BIGINT NOT NULL,
                stage TEXT NOT NULL,
                modified TIMESTAMPTZ NOT NULL,
                next_auto_resume TIMESTAMPTZ,
                has_cold_queued BOOLEAN NOT NULL DEFAULT false,
                document JSONB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_delta_files_stage_modified
                ON delta_files(stage, modified);

            CREATE INDEX IF NOT EXISTS idx_delta_files_cold
                ON delta_files(modified)
                WHERE has_cold_queued;

            CREATE INDEX IF NOT EXISTS idx_delta_files_auto_resume
                ON delta_files(next_auto_resume)
                WHERE next_auto_resume IS NOT NULL;
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode(row: &PgRow) -> StoreResult<DeltaFile> {
        let document: serde_json::Value = row.try_get("document")?;
        Ok(serde_json::from_value(document)?)
    }
}

#[async_trait]
impl UnitStore for PostgresUnitStore {
    async fn load(&self, did: Uuid) -> StoreResult<Option<DeltaFile>> {
        let row = sqlx::query("SELECT document FROM delta_files WHERE did = $1")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn save(&self, unit: &mut DeltaFile) -> StoreResult<()> {
        let expected = unit.version;
        unit.version = expected + 1;
        let document = serde_json::to_value(&*unit)?;

        let updated = sqlx::query(
            r#"
            UPDATE delta_files
            SET version = $2, stage = $3, modified = $4,
                next_auto_resume = $5, has_cold_queued = $6, document = $7
            WHERE did = $1 AND version = $8
            "#,
        )
        .bind(unit.did)
        .bind(unit.version)
        .bind(stage_str(unit.stage))
        .bind(unit.modified)
        .bind(unit.next_auto_resume)
        .bind(unit.has_cold_queued_actions())
        .bind(&document)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO delta_files
                (did, version, stage, modified, next_auto_resume, has_cold_queued, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (did) DO NOTHING
            "#,
        )
        .bind(unit.did)
        .bind(unit.version)
        .bind(stage_str(unit.stage))
        .bind(unit.modified)
        .bind(unit.next_auto_resume)
        .bind(unit.has_cold_queued_actions())
        .bind(&document)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        unit.version = expected;
        Err(StoreError::VersionConflict(unit.did))
    }

    async fn insert_batch(&self, units: &mut [DeltaFile]) -> StoreResult<()> {
        if units.is_empty() {
            return Ok(());
        }
        let mut payloads = Vec::with_capacity(units.len());
        for unit in units.iter_mut() {
            unit.version = 1;
            payloads.push((
                unit.did,
                stage_str(unit.stage),
                unit.modified,
                unit.next_auto_resume,
                unit.has_cold_queued_actions(),
                serde_json::to_value(&*unit)?,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO delta_files \
             (did, version, stage, modified, next_auto_resume, has_cold_queued, document) ",
        );
        builder.push_values(
            payloads.iter(),
            |mut b, (did, stage, modified, resume, cold, document)| {
                b.push_bind(*did)
                    .push_bind(1i64)
                    .push_bind(*stage)
                    .push_bind(*modified)
                    .push_bind(*resume)
                    .push_bind(*cold)
                    .push_bind(document);
            },
        );
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete(&self, dids: &[Uuid]) -> StoreResult<()> {
        if dids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM delta_files WHERE did = ANY($1)")
            .bind(dids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stale_queued(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DeltaFile>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM delta_files
            WHERE stage IN ('INGRESS', 'ENRICH', 'EGRESS') AND modified <= $1
            ORDER BY modified
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut matched = Vec::new();
        for row in &rows {
            let unit = Self::decode(row)?;
            let stale = unit.flows.iter().any(|f| {
                f.actions.iter().any(|a| {
                    a.state == ActionState::Queued && a.queued.map(|q| q <= cutoff).unwrap_or(false)
                })
            });
            if stale {
                matched.push(unit);
            }
        }
        Ok(matched)
    }

    async fn cold_queued(&self, action_class: &str, limit: usize) -> StoreResult<Vec<DeltaFile>> {
        let rows = sqlx::query(
            "SELECT document FROM delta_files WHERE has_cold_queued ORDER BY modified",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut matched = Vec::new();
        for row in &rows {
            let unit = Self::decode(row)?;
            if !unit.cold_queued_actions(action_class).is_empty() {
                matched.push(unit);
                if matched.len() >= limit {
                    break;
                }
            }
        }
        Ok(matched)
    }

    async fn cold_queue_counts(&self) -> StoreResult<HashMap<String, usize>> {
        let rows = sqlx::query("SELECT document FROM delta_files WHERE has_cold_queued")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for row in &rows {
            let unit = Self::decode(row)?;
            for flow in &unit.flows {
                for action in &flow.actions {
                    if action.state == ActionState::ColdQueued {
                        if let Some(class) = &action.action_class {
                            *counts.entry(class.clone()).or_default() += 1;
                        }
                    }
                }
            }
        }
        Ok(counts)
    }

    async fn auto_resume_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DeltaFile>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM delta_files
            WHERE stage = 'ERROR' AND next_auto_resume IS NOT NULL AND next_auto_resume <= $1
            ORDER BY next_auto_resume
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode).collect()
    }
}

pub struct PostgresJoinStore {
    pool: PgPool,
}

impl PostgresJoinStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS join_entries (
                id UUID PRIMARY KEY,
                join_key TEXT NOT NULL UNIQUE,
                definition JSONB NOT NULL,
                deadline TIMESTAMPTZ NOT NULL,
                min_num INTEGER,
                max_num INTEGER NOT NULL,
                count INTEGER NOT NULL,
                locked BOOLEAN NOT NULL DEFAULT false,
                locked_at TIMESTAMPTZ
            );

            CREATE INDEX IF NOT EXISTS idx_join_entries_deadline
                ON join_entries(deadline)
                WHERE NOT locked;

            CREATE TABLE IF NOT EXISTS join_entry_dids (
                id UUID PRIMARY KEY,
                entry_id UUID NOT NULL,
                did UUID NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_join_entry_dids_entry
                ON join_entry_dids(entry_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode(row: &PgRow) -> StoreResult<JoinEntry> {
        let definition: serde_json::Value = row.try_get("definition")?;
        Ok(JoinEntry {
            id: row.try_get("id")?,
            definition: serde_json::from_value(definition)?,
            deadline: row.try_get("deadline")?,
            min_num: row.try_get("min_num")?,
            max_num: row.try_get("max_num")?,
            count: row.try_get("count")?,
            locked: row.try_get("locked")?,
            locked_at: row.try_get("locked_at")?,
        })
    }
}

const ENTRY_COLUMNS: &str = "id, definition, deadline, min_num, max_num, count, locked, locked_at";

#[async_trait]
impl JoinStore for PostgresJoinStore {
    async fn upsert_and_lock(
        &self,
        definition: &JoinDefinition,
        deadline: DateTime<Utc>,
        min_num: Option<i32>,
        max_num: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JoinEntry>> {
        let sql = format!(
            r#"
            INSERT INTO join_entries
                (id, join_key, definition, deadline, min_num, max_num, count, locked, locked_at)
            VALUES ($1, $2, $3, $4, $5, $6, 1, true, $7)
            ON CONFLICT (join_key) DO UPDATE
            SET count = join_entries.count + 1, locked = true, locked_at = $7
            WHERE join_entries.locked = false
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(definition.key())
            .bind(serde_json::to_value(definition)?)
            .bind(deadline)
            .bind(min_num)
            .bind(max_num)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn add_did(&self, entry_id: Uuid, did: Uuid) -> StoreResult<()> {
        sqlx::query("INSERT INTO join_entry_dids (id, entry_id, did) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(entry_id)
            .bind(did)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn entry_dids(&self, entry_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT did FROM join_entry_dids WHERE entry_id = $1")
            .bind(entry_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("did").map_err(StoreError::from))
            .collect()
    }

    async fn unlock(&self, entry_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE join_entries SET locked = false, locked_at = NULL WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unlock_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE join_entries SET locked = false, locked_at = NULL
            WHERE locked AND (locked_at IS NULL OR locked_at <= $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn lock_one_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JoinEntry>> {
        let sql = format!(
            r#"
            UPDATE join_entries SET locked = true, locked_at = $2
            WHERE id = (
                SELECT id FROM join_entries
                WHERE NOT locked AND deadline <= $1
                ORDER BY deadline
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(cutoff)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn delete_entry(&self, entry_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM join_entry_dids WHERE entry_id = $1")
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM join_entries WHERE id = $1")
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn orphaned_dids(&self, limit: usize) -> StoreResult<Vec<JoinEntryDid>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.entry_id, d.did
            FROM join_entry_dids d
            LEFT JOIN join_entries e ON e.id = d.entry_id
            WHERE e.id IS NULL
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(JoinEntryDid {
                    id: r.try_get("id")?,
                    entry_id: r.try_get("entry_id")?,
                    did: r.try_get("did")?,
                })
            })
            .collect()
    }

    async fn delete_did_row(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM join_entry_dids WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
