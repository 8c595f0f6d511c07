//! Durable persistence seams for units and join entries.
//!
//! [`UnitStore`] is the optimistic-concurrency boundary: every mutation path
//! reads a unit, modifies it, and writes it back with a version check. A
//! conflicting writer gets [`StoreError::VersionConflict`]; only the event
//! dispatcher retries that.
//!
//! [`JoinStore`] provides the atomic upsert-increment-and-lock the join
//! coordinator is built on. Locking happens at the backend, never via an
//! in-process mutex, because arrivals race from independent processes.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::join::{JoinDefinition, JoinEntry, JoinEntryDid};
use crate::types::DeltaFile;

pub use memory::{MemoryJoinStore, MemoryUnitStore};
pub use postgres::{PostgresJoinStore, PostgresUnitStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict writing DeltaFile {0}")]
    VersionConflict(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait UnitStore: Send + Sync {
    async fn load(&self, did: Uuid) -> StoreResult<Option<DeltaFile>>;

    /// Versioned write. Inserts when the unit is new; otherwise the stored
    /// version must equal `unit.version` or the write fails with
    /// `VersionConflict`. On success the version is bumped both in storage
    /// and on `unit`.
    async fn save(&self, unit: &mut DeltaFile) -> StoreResult<()>;

    /// Bulk insert of freshly created units (split/join children).
    async fn insert_batch(&self, units: &mut [DeltaFile]) -> StoreResult<()>;

    async fn delete(&self, dids: &[Uuid]) -> StoreResult<()>;

    /// Non-terminal units carrying a QUEUED action whose queue timestamp is
    /// at or before `cutoff`.
    async fn stale_queued(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DeltaFile>>;

    /// Oldest units carrying COLD_QUEUED actions for the given class.
    async fn cold_queued(&self, action_class: &str, limit: usize) -> StoreResult<Vec<DeltaFile>>;

    /// COLD_QUEUED action counts grouped by action class.
    async fn cold_queue_counts(&self) -> StoreResult<HashMap<String, usize>>;

    /// Errored units whose `next_auto_resume` is due.
    async fn auto_resume_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DeltaFile>>;
}

#[async_trait]
pub trait JoinStore: Send + Sync {
    /// One atomic create-or-increment-and-lock attempt. Returns the locked
    /// entry (with the incremented arrival count) or `None` when another
    /// actor currently holds the lock. Never blocks; the coordinator owns
    /// the retry loop.
    async fn upsert_and_lock(
        &self,
        definition: &JoinDefinition,
        deadline: DateTime<Utc>,
        min_num: Option<i32>,
        max_num: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JoinEntry>>;

    async fn add_did(&self, entry_id: Uuid, did: Uuid) -> StoreResult<()>;

    async fn entry_dids(&self, entry_id: Uuid) -> StoreResult<Vec<Uuid>>;

    async fn unlock(&self, entry_id: Uuid) -> StoreResult<()>;

    /// Force-release locks held since before `cutoff` (crash recovery).
    /// Returns how many were released.
    async fn unlock_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Atomically select-and-lock one unlocked entry whose deadline is at
    /// or before `cutoff`, so concurrent reapers never double-process.
    async fn lock_one_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JoinEntry>>;

    /// Delete the entry and all its participant rows.
    async fn delete_entry(&self, entry_id: Uuid) -> StoreResult<()>;

    /// Participant rows whose entry no longer exists.
    async fn orphaned_dids(&self, limit: usize) -> StoreResult<Vec<JoinEntryDid>>;

    async fn delete_did_row(&self, id: Uuid) -> StoreResult<()>;
}
