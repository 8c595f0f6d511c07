//! In-process store backends, used by tests and single-node deployments.
//!
//! Both stores guard their state with one async mutex, which makes every
//! trait method atomic with respect to the others. That is the same
//! guarantee the postgres backend gets from single statements.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::join::{JoinDefinition, JoinEntry, JoinEntryDid};
use crate::types::{ActionState, DeltaFile, Stage};

use super::{JoinStore, StoreError, StoreResult, UnitStore};

#[derive(Default)]
pub struct MemoryUnitStore {
    units: Mutex<HashMap<Uuid, DeltaFile>>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.units.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.units.lock().await.is_empty()
    }
}

#[async_trait]
impl UnitStore for MemoryUnitStore {
    async fn load(&self, did: Uuid) -> StoreResult<Option<DeltaFile>> {
        Ok(self.units.lock().await.get(&did).cloned())
    }

    async fn save(&self, unit: &mut DeltaFile) -> StoreResult<()> {
        let mut units = self.units.lock().await;
        match units.get(&unit.did) {
            Some(stored) if stored.version != unit.version => {
                return Err(StoreError::VersionConflict(unit.did));
            }
            _ => {}
        }
        unit.version += 1;
        units.insert(unit.did, unit.clone());
        Ok(())
    }

    async fn insert_batch(&self, new_units: &mut [DeltaFile]) -> StoreResult<()> {
        let mut units = self.units.lock().await;
        for unit in new_units.iter_mut() {
            unit.version = 1;
            units.insert(unit.did, unit.clone());
        }
        Ok(())
    }

    async fn delete(&self, dids: &[Uuid]) -> StoreResult<()> {
        let mut units = self.units.lock().await;
        for did in dids {
            units.remove(did);
        }
        Ok(())
    }

    async fn stale_queued(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DeltaFile>> {
        let units = self.units.lock().await;
        let mut matched: Vec<DeltaFile> = units
            .values()
            .filter(|u| !u.stage.is_terminal())
            .filter(|u| {
                u.flows.iter().any(|f| {
                    f.actions.iter().any(|a| {
                        a.state == ActionState::Queued
                            && a.queued.map(|q| q <= cutoff).unwrap_or(false)
                    })
                })
            })
            .cloned()
            .collect();
        matched.sort_by_key(|u| u.modified);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn cold_queued(&self, action_class: &str, limit: usize) -> StoreResult<Vec<DeltaFile>> {
        let units = self.units.lock().await;
        let mut matched: Vec<DeltaFile> = units
            .values()
            .filter(|u| !u.cold_queued_actions(action_class).is_empty())
            .cloned()
            .collect();
        matched.sort_by_key(|u| u.modified);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn cold_queue_counts(&self) -> StoreResult<HashMap<String, usize>> {
        let units = self.units.lock().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for unit in units.values() {
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
        let units = self.units.lock().await;
        let mut matched: Vec<DeltaFile> = units
            .values()
            .filter(|u| u.stage == Stage::Error)
            .filter(|u| u.next_auto_resume.map(|t| t <= now).unwrap_or(false))
            .cloned()
            .collect();
        matched.sort_by_key(|u| u.next_auto_resume);
        matched.truncate(limit);
        Ok(matched)
    }
}

#[derive(Default)]
struct JoinInner {
    entries: HashMap<Uuid, JoinEntry>,
    dids: Vec<JoinEntryDid>,
}

#[derive(Default)]
pub struct MemoryJoinStore {
    inner: Mutex<JoinInner>,
}

impl MemoryJoinStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JoinStore for MemoryJoinStore {
    async fn upsert_and_lock(
        &self,
        definition: &JoinDefinition,
        deadline: DateTime<Utc>,
        min_num: Option<i32>,
        max_num: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JoinEntry>> {
        let mut inner = self.inner.lock().await;
        let key = definition.key();
        if let Some(entry) = inner
            .entries
            .values_mut()
            .find(|e| e.definition.key() == key)
        {
            if entry.locked {
                return Ok(None);
            }
            entry.locked = true;
            entry.locked_at = Some(now);
            entry.count += 1;
            return Ok(Some(entry.clone()));
        }
        let entry = JoinEntry {
            id: Uuid::new_v4(),
            definition: definition.clone(),
            deadline,
            min_num,
            max_num,
            count: 1,
            locked: true,
            locked_at: Some(now),
        };
        inner.entries.insert(entry.id, entry.clone());
        Ok(Some(entry))
    }

    async fn add_did(&self, entry_id: Uuid, did: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.dids.push(JoinEntryDid {
            id: Uuid::new_v4(),
            entry_id,
            did,
        });
        Ok(())
    }

    async fn entry_dids(&self, entry_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dids
            .iter()
            .filter(|d| d.entry_id == entry_id)
            .map(|d| d.did)
            .collect())
    }

    async fn unlock(&self, entry_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&entry_id) {
            entry.locked = false;
            entry.locked_at = None;
        }
        Ok(())
    }

    async fn unlock_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut released = 0;
        for entry in inner.entries.values_mut() {
            if entry.locked && entry.locked_at.map(|t| t <= cutoff).unwrap_or(true) {
                entry.locked = false;
                entry.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn lock_one_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JoinEntry>> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .entries
            .values_mut()
            .filter(|e| !e.locked && e.deadline <= cutoff)
            .min_by_key(|e| e.deadline);
        if let Some(entry) = candidate {
            entry.locked = true;
            entry.locked_at = Some(now);
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    async fn delete_entry(&self, entry_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(&entry_id);
        inner.dids.retain(|d| d.entry_id != entry_id);
        Ok(())
    }

    async fn orphaned_dids(&self, limit: usize) -> StoreResult<Vec<JoinEntryDid>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dids
            .iter()
            .filter(|d| !inner.entries.contains_key(&d.entry_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_did_row(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.dids.retain(|d| d.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowType, SourceInfo};
    use crate::types::{ActionType as AT, DeltaFile};

    fn unit(flow: &str) -> DeltaFile {
        DeltaFile::new_ingress(
            Uuid::new_v4(),
            SourceInfo {
                filename: "f".to_string(),
                flow: flow.to_string(),
                metadata: HashMap::new(),
            },
            vec![],
            vec![],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn save_detects_version_conflicts() {
        let store = MemoryUnitStore::new();
        let mut original = unit("sample");
        store.save(&mut original).await.unwrap();
        assert_eq!(original.version, 1);

        let mut copy_a = store.load(original.did).await.unwrap().unwrap();
        let mut copy_b = store.load(original.did).await.unwrap().unwrap();
        store.save(&mut copy_a).await.unwrap();
        let err = store.save(&mut copy_b).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(did) if did == original.did));
    }

    #[tokio::test]
    async fn stale_queued_filters_by_state_and_cutoff() {
        let store = MemoryUnitStore::new();
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(10);

        let mut stale = unit("sample");
        stale.queue_action(
            "sample",
            FlowType::Ingress,
            "LoadAction",
            AT::Load,
            Some("org.example.Load"),
            ActionState::Queued,
            old,
        );
        store.save(&mut stale).await.unwrap();

        let mut fresh = unit("sample");
        fresh.queue_action(
            "sample",
            FlowType::Ingress,
            "LoadAction",
            AT::Load,
            Some("org.example.Load"),
            ActionState::Queued,
            now,
        );
        store.save(&mut fresh).await.unwrap();

        let mut joining = unit("sample");
        joining.queue_action(
            "sample",
            FlowType::Ingress,
            "JoinAction",
            AT::Load,
            Some("org.example.Join"),
            ActionState::Joining,
            old,
        );
        store.save(&mut joining).await.unwrap();

        let cutoff = now - chrono::Duration::minutes(5);
        let found = store.stale_queued(cutoff, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].did, stale.did);
    }

    #[tokio::test]
    async fn cold_queue_counts_group_by_class() {
        let store = MemoryUnitStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            let mut u = unit("sample");
            u.queue_action(
                "sample",
                FlowType::Ingress,
                "LoadAction",
                AT::Load,
                Some("org.example.Load"),
                ActionState::ColdQueued,
                now,
            );
            store.save(&mut u).await.unwrap();
        }
        let counts = store.cold_queue_counts().await.unwrap();
        assert_eq!(counts.get("org.example.Load"), Some(&3));

        let cold = store.cold_queued("org.example.Load", 2).await.unwrap();
        assert_eq!(cold.len(), 2);
    }
}
