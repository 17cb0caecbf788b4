//! In-process backend with the same uniqueness rules as the Postgres schema.
//!
//! Row locks are real (one tokio mutex per registry row), so concurrent materializations
//! serialize the same way they do under `SELECT ... FOR UPDATE`. Transaction writes are applied
//! immediately; `rollback` only releases locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use padron_core::{
    Association, AssociationStatus, IdentityProfile, KeySpace, MaterializedIdentity, NewIdentity,
    RegistryRow, RegistryRowDraft, SyncCursor,
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::warn;

use crate::{
    CursorStore, IdentityStore, IdentityTx, RegistryStore, StoreError, StoreResult, SyncLease,
    TagDiff, TagStore, UpsertBatch, UpsertReport,
};

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    cursors: HashMap<String, SyncCursor>,
    leases: HashMap<String, Lease>,
    rows: BTreeMap<i64, RegistryRow>,
    next_row_id: i64,
    identities: BTreeMap<i64, MaterializedIdentity>,
    next_identity_id: i64,
    tags: BTreeMap<(i64, i64), Option<i64>>,
    associations: BTreeMap<i64, Association>,
    next_association_id: i64,
}

impl Tables {
    fn row_id_for(&self, space: KeySpace, key: &str) -> Option<i64> {
        self.rows
            .values()
            .find(|row| match space {
                KeySpace::Secondary => row.secondary_key.as_deref() == Some(key),
                KeySpace::Primary => {
                    row.secondary_key.is_none() && row.primary_key.as_deref() == Some(key)
                }
            })
            .map(|row| row.id)
    }

    fn upsert(&mut self, space: KeySpace, draft: &RegistryRowDraft, now: DateTime<Utc>, report: &mut UpsertReport) {
        let target = self.row_id_for(space, draft.match_key());

        if let Some(barcode) = &draft.external_barcode {
            for row in self.rows.values_mut() {
                if Some(row.id) != target && row.external_barcode.as_deref() == Some(barcode.as_str()) {
                    warn!(
                        barcode = %barcode,
                        key_space = space.as_str(),
                        key = draft.match_key(),
                        "barcode moved from another registry row"
                    );
                    row.external_barcode = None;
                    row.updated_at = now;
                    report.barcode_reassignments += 1;
                }
            }
        }

        match target.and_then(|id| self.rows.get_mut(&id)) {
            Some(row) => {
                row.display_name = draft.display_name.clone();
                row.external_barcode = draft.external_barcode.clone();
                row.balance = draft.balance;
                row.risk_flag = draft.risk_flag;
                row.last_unpaid_period = draft.last_unpaid_period;
                row.full_access_granted = draft.full_access_granted;
                row.controls_enabled = draft.controls_enabled;
                row.controls_enabled_raw = draft.controls_enabled_raw.clone();
                row.raw_source = draft.raw_source.clone();
                row.updated_at = now;
                report.updated += 1;
            }
            None => {
                self.next_row_id += 1;
                let id = self.next_row_id;
                self.rows.insert(
                    id,
                    RegistryRow {
                        id,
                        primary_key: draft.primary_key.clone(),
                        secondary_key: draft.secondary_key.clone(),
                        display_name: draft.display_name.clone(),
                        external_barcode: draft.external_barcode.clone(),
                        balance: draft.balance,
                        risk_flag: draft.risk_flag,
                        last_unpaid_period: draft.last_unpaid_period,
                        full_access_granted: draft.full_access_granted,
                        controls_enabled: draft.controls_enabled,
                        controls_enabled_raw: draft.controls_enabled_raw.clone(),
                        raw_source: draft.raw_source.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                report.inserted += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    row_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn identity_count(&self) -> usize {
        self.tables.read().await.identities.len()
    }

    pub async fn association_count(&self) -> usize {
        self.tables.read().await.associations.len()
    }

    pub async fn identities(&self) -> Vec<MaterializedIdentity> {
        self.tables.read().await.identities.values().cloned().collect()
    }

    async fn row_lock(&self, id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.row_locks.lock().await;
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get_cursor(&self, name: &str) -> StoreResult<Option<SyncCursor>> {
        Ok(self.tables.read().await.cursors.get(name).cloned())
    }

    async fn set_cursor(&self, name: &str, value: &str) -> StoreResult<SyncCursor> {
        let cursor = SyncCursor {
            name: name.to_string(),
            value: value.to_string(),
            updated_at: Utc::now(),
        };
        self.tables
            .write()
            .await
            .cursors
            .insert(name.to_string(), cursor.clone());
        Ok(cursor)
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn upsert_registry_rows(&self, batch: &UpsertBatch) -> StoreResult<UpsertReport> {
        let mut report = UpsertReport::default();
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        for draft in &batch.secondary {
            tables.upsert(KeySpace::Secondary, draft, now, &mut report);
        }
        for draft in &batch.primary {
            tables.upsert(KeySpace::Primary, draft, now, &mut report);
        }
        Ok(report)
    }

    async fn find_registry_row_by_key(&self, key: &str) -> StoreResult<Option<RegistryRow>> {
        let key = key.trim();
        let tables = self.tables.read().await;
        let by_primary = tables
            .rows
            .values()
            .find(|row| row.primary_key.as_deref() == Some(key));
        let found = by_primary.or_else(|| {
            tables
                .rows
                .values()
                .find(|row| row.secondary_key.as_deref() == Some(key))
        });
        Ok(found.cloned())
    }

    async fn list_registry_rows(&self, after_id: i64, limit: usize) -> StoreResult<Vec<RegistryRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .rows
            .range(after_id.saturating_add(1)..)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn count_registry_rows(&self) -> StoreResult<u64> {
        Ok(self.tables.read().await.rows.len() as u64)
    }
}

#[async_trait]
impl TagStore for MemoryStore {
    async fn tag_registry_row(&self, owner_id: i64, row_id: i64, assigned_by: Option<i64>) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if !tables.rows.contains_key(&row_id) {
            return Err(StoreError::NotFound(format!("registry row {row_id}")));
        }
        if tables.tags.contains_key(&(owner_id, row_id)) {
            return Ok(false);
        }
        tables.tags.insert((owner_id, row_id), assigned_by);
        Ok(true)
    }

    async fn untag_registry_row(&self, owner_id: i64, row_id: i64) -> StoreResult<bool> {
        Ok(self
            .tables
            .write()
            .await
            .tags
            .remove(&(owner_id, row_id))
            .is_some())
    }

    async fn replace_tags(&self, owner_id: i64, row_ids: &[i64], assigned_by: Option<i64>) -> StoreResult<TagDiff> {
        let mut wanted = row_ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let mut tables = self.tables.write().await;
        if let Some(missing) = wanted.iter().find(|id| !tables.rows.contains_key(*id)) {
            return Err(StoreError::NotFound(format!("registry row {missing}")));
        }

        let current: Vec<i64> = tables
            .tags
            .range((owner_id, i64::MIN)..=(owner_id, i64::MAX))
            .map(|((_, row_id), _)| *row_id)
            .collect();

        let mut diff = TagDiff::default();
        for row_id in &current {
            if wanted.binary_search(row_id).is_err() {
                tables.tags.remove(&(owner_id, *row_id));
                diff.removed.push(*row_id);
            }
        }
        for row_id in &wanted {
            if !current.contains(row_id) {
                tables.tags.insert((owner_id, *row_id), assigned_by);
                diff.added.push(*row_id);
            }
        }
        Ok(diff)
    }

    async fn list_tagged(&self, owner_id: i64) -> StoreResult<Vec<i64>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .range((owner_id, i64::MIN)..=(owner_id, i64::MAX))
            .map(|((_, row_id), _)| *row_id)
            .collect())
    }
}

pub struct MemoryIdentityTx {
    store: MemoryStore,
    held: Vec<OwnedMutexGuard<()>>,
}

#[async_trait]
impl IdentityTx for MemoryIdentityTx {
    async fn lock_registry_row(&mut self, id: i64) -> StoreResult<Option<RegistryRow>> {
        if !self.store.tables.read().await.rows.contains_key(&id) {
            return Ok(None);
        }
        let guard = self.store.row_lock(id).await;
        self.held.push(guard);
        Ok(self.store.tables.read().await.rows.get(&id).cloned())
    }

    async fn registry_row_exists(&mut self, id: i64) -> StoreResult<bool> {
        Ok(self.store.tables.read().await.rows.contains_key(&id))
    }

    async fn identity_by_natural_key(&mut self, key: &str) -> StoreResult<Option<MaterializedIdentity>> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .identities
            .values()
            .find(|identity| identity.natural_key == key)
            .cloned())
    }

    async fn identity_by_synthetic_key(&mut self, key: &str) -> StoreResult<Option<MaterializedIdentity>> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .identities
            .values()
            .find(|identity| identity.synthetic_key.as_deref() == Some(key))
            .cloned())
    }

    async fn synthetic_identity_for_row(&mut self, row_id: i64) -> StoreResult<Option<MaterializedIdentity>> {
        let tables = self.store.tables.read().await;
        Ok(tables
            .identities
            .values()
            .find(|identity| identity.synthetic_key.is_some() && identity.profile.registry_row_id == row_id)
            .cloned())
    }

    async fn insert_identity(&mut self, identity: &NewIdentity) -> StoreResult<Option<MaterializedIdentity>> {
        let mut tables = self.store.tables.write().await;
        let taken = tables.identities.values().any(|existing| {
            existing.natural_key == identity.natural_key
                || (identity.synthetic_key.is_some()
                    && (existing.synthetic_key == identity.synthetic_key
                        || (existing.synthetic_key.is_some()
                            && existing.profile.registry_row_id == identity.profile.registry_row_id)))
        });
        if taken {
            return Ok(None);
        }
        tables.next_identity_id += 1;
        let now = Utc::now();
        let created = MaterializedIdentity {
            id: tables.next_identity_id,
            natural_key: identity.natural_key.clone(),
            synthetic_key: identity.synthetic_key.clone(),
            profile: identity.profile.clone(),
            credential_digest: identity.credential_digest.clone(),
            created_at: now,
            refreshed_at: now,
        };
        tables.identities.insert(created.id, created.clone());
        Ok(Some(created))
    }

    async fn refresh_identity(&mut self, id: i64, profile: &IdentityProfile) -> StoreResult<MaterializedIdentity> {
        let mut tables = self.store.tables.write().await;
        let identity = tables
            .identities
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))?;
        identity.profile = profile.clone();
        identity.refreshed_at = Utc::now();
        Ok(identity.clone())
    }

    async fn association_by_id(&mut self, id: i64) -> StoreResult<Option<Association>> {
        Ok(self.store.tables.read().await.associations.get(&id).cloned())
    }

    async fn is_row_tagged(&mut self, owner_id: i64, row_id: i64) -> StoreResult<bool> {
        Ok(self
            .store
            .tables
            .read()
            .await
            .tags
            .contains_key(&(owner_id, row_id)))
    }

    async fn activate_association(&mut self, owner_id: i64, subject_id: i64) -> StoreResult<Association> {
        let mut tables = self.store.tables.write().await;
        if !tables.identities.contains_key(&subject_id) {
            return Err(StoreError::NotFound(format!("identity {subject_id}")));
        }
        let now = Utc::now();
        let existing = tables
            .associations
            .values_mut()
            .find(|a| a.owner_id == owner_id && a.subject_id == subject_id);
        if let Some(association) = existing {
            if association.status == AssociationStatus::Ended {
                association.status = AssociationStatus::Active;
                association.ended_at = None;
                association.updated_at = now;
            }
            return Ok(association.clone());
        }
        tables.next_association_id += 1;
        let association = Association {
            id: tables.next_association_id,
            owner_id,
            subject_id,
            status: AssociationStatus::Active,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        tables.associations.insert(association.id, association.clone());
        Ok(association)
    }

    async fn end_association(&mut self, id: i64) -> StoreResult<Association> {
        let mut tables = self.store.tables.write().await;
        let association = tables
            .associations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("association {id}")))?;
        let now = Utc::now();
        association.status = AssociationStatus::Ended;
        association.ended_at = Some(association.ended_at.unwrap_or(now));
        association.updated_at = now;
        Ok(association.clone())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let Self { held, .. } = *self;
        drop(held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let Self { held, .. } = *self;
        drop(held);
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn IdentityTx>> {
        Ok(Box::new(MemoryIdentityTx {
            store: self.clone(),
            held: Vec::new(),
        }))
    }
}

#[async_trait]
impl SyncLease for MemoryStore {
    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut tables = self.tables.write().await;
        if let Some(lease) = tables.leases.get(name) {
            if lease.holder != holder && lease.expires_at >= now {
                return Ok(false);
            }
        }
        tables.leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.leases.get(name).map(|l| l.holder == holder).unwrap_or(false) {
            tables.leases.remove(name);
        }
        Ok(())
    }
}
