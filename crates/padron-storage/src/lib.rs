//! Persistence contracts for the registry mirror, with Postgres and in-process backends.
//!
//! Uniqueness is enforced by the backend (schema constraints in Postgres, the same rules in
//! [`MemoryStore`]); callers treat application-level lookups as advisory only.

use std::time::Duration;

use async_trait::async_trait;
use padron_core::{
    Association, IdentityProfile, MaterializedIdentity, NewIdentity, RegistryRow,
    RegistryRowDraft, SyncCursor,
};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "padron-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Named watermarks. Last writer wins.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, name: &str) -> StoreResult<Option<SyncCursor>>;

    async fn set_cursor(&self, name: &str, value: &str) -> StoreResult<SyncCursor>;

    async fn cursor_value_or(&self, name: &str, default: Option<String>) -> StoreResult<Option<String>> {
        Ok(self.get_cursor(name).await?.map(|c| c.value).or(default))
    }
}

/// Rows of one sync run, already partitioned and de-duplicated per key space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertBatch {
    pub secondary: Vec<RegistryRowDraft>,
    pub primary: Vec<RegistryRowDraft>,
}

impl UpsertBatch {
    pub fn len(&self) -> usize {
        self.secondary.len() + self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub barcode_reassignments: usize,
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Applies the whole batch atomically: either every row is written or none is.
    async fn upsert_registry_rows(&self, batch: &UpsertBatch) -> StoreResult<UpsertReport>;

    /// Primary key match wins over a secondary key match.
    async fn find_registry_row_by_key(&self, key: &str) -> StoreResult<Option<RegistryRow>>;

    async fn list_registry_rows(&self, after_id: i64, limit: usize) -> StoreResult<Vec<RegistryRow>>;

    async fn count_registry_rows(&self) -> StoreResult<u64>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
}

/// Owner -> registry row visibility links.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Returns `true` when the link did not exist before.
    async fn tag_registry_row(&self, owner_id: i64, row_id: i64, assigned_by: Option<i64>) -> StoreResult<bool>;

    async fn untag_registry_row(&self, owner_id: i64, row_id: i64) -> StoreResult<bool>;

    /// Replaces the owner's full tag set. Fails with `NotFound` if any row is unknown.
    async fn replace_tags(&self, owner_id: i64, row_ids: &[i64], assigned_by: Option<i64>) -> StoreResult<TagDiff>;

    async fn list_tagged(&self, owner_id: i64) -> StoreResult<Vec<i64>>;
}

/// Unit of work used by materialization and association resolution.
///
/// Dropping a transaction without calling [`IdentityTx::commit`] rolls it back.
#[async_trait]
pub trait IdentityTx: Send {
    /// Locks the row until the transaction ends.
    async fn lock_registry_row(&mut self, id: i64) -> StoreResult<Option<RegistryRow>>;

    async fn registry_row_exists(&mut self, id: i64) -> StoreResult<bool>;

    async fn identity_by_natural_key(&mut self, key: &str) -> StoreResult<Option<MaterializedIdentity>>;

    async fn identity_by_synthetic_key(&mut self, key: &str) -> StoreResult<Option<MaterializedIdentity>>;

    /// The synthetic-keyed identity owned by a registry row, whatever key it was created under.
    async fn synthetic_identity_for_row(&mut self, row_id: i64) -> StoreResult<Option<MaterializedIdentity>>;

    /// Returns `None` when a uniqueness constraint rejected the insert.
    async fn insert_identity(&mut self, identity: &NewIdentity) -> StoreResult<Option<MaterializedIdentity>>;

    /// Overwrites denormalized fields only; keys and credential are left as they are.
    async fn refresh_identity(&mut self, id: i64, profile: &IdentityProfile) -> StoreResult<MaterializedIdentity>;

    async fn association_by_id(&mut self, id: i64) -> StoreResult<Option<Association>>;

    async fn is_row_tagged(&mut self, owner_id: i64, row_id: i64) -> StoreResult<bool>;

    /// Get-or-create on `(owner, subject)`, reactivating an ended association in place.
    async fn activate_association(&mut self, owner_id: i64, subject_id: i64) -> StoreResult<Association>;

    async fn end_association(&mut self, id: i64) -> StoreResult<Association>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn IdentityTx>>;
}

/// Cluster-wide single-flight lease with a bounded lifetime.
#[async_trait]
pub trait SyncLease: Send + Sync {
    /// Succeeds when the lease is free, expired, or already held by `holder`.
    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<bool>;

    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()>;
}
