use std::collections::BTreeMap;
use std::sync::Arc;

use padron_core::{MaterializedIdentity, NewIdentity, RegistryRow};
use padron_storage::{IdentityStore, IdentityTx, RegistryStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::keys::{
    derived_credential, natural_key, profile_from_row, random_credential, row_key, synthetic_key,
};
use crate::{finish, IdentityError, IdentityResult};

#[derive(Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub materialized: Vec<MaterializedIdentity>,
    /// Requested key -> failure message.
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub updated: usize,
    pub skipped: usize,
    /// Registry row id -> failure message.
    pub errors: BTreeMap<i64, String>,
}

/// Turns registry rows into local identities. Safe to call concurrently for the same row.
#[derive(Clone)]
pub struct Materializer {
    identities: Arc<dyn IdentityStore>,
    registry: Arc<dyn RegistryStore>,
}

impl Materializer {
    pub fn new(identities: Arc<dyn IdentityStore>, registry: Arc<dyn RegistryStore>) -> Self {
        Self {
            identities,
            registry,
        }
    }

    pub async fn materialize(&self, registry_row_id: i64) -> IdentityResult<MaterializedIdentity> {
        let mut tx = self.identities.begin().await?;
        let result = self.materialize_in(tx.as_mut(), registry_row_id).await;
        finish(tx, result).await
    }

    /// Runs inside the caller's transaction. The registry row stays locked until it ends.
    pub async fn materialize_in(
        &self,
        tx: &mut dyn IdentityTx,
        registry_row_id: i64,
    ) -> IdentityResult<MaterializedIdentity> {
        let row = tx
            .lock_registry_row(registry_row_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("registry row {registry_row_id}")))?;
        let profile = profile_from_row(&row);

        if let Some(existing) = existing_identity(tx, &row).await? {
            return Ok(tx.refresh_identity(existing.id, &profile).await?);
        }

        let new = new_identity(tx, &row).await?;
        if let Some(created) = tx.insert_identity(&new).await? {
            info!(registry_row_id, identity_id = created.id, key = %new.natural_key, "identity materialized");
            return Ok(created);
        }

        // Lost the insert race to a concurrent transaction; the winner's row is visible now.
        warn!(registry_row_id, key = %new.natural_key, "identity insert conflicted, refreshing winner");
        let winner = existing_identity(tx, &row).await?.ok_or_else(|| {
            StoreError::Conflict(format!("identity key {} taken by an unrelated identity", new.natural_key))
        })?;
        Ok(tx.refresh_identity(winner.id, &profile).await?)
    }

    /// Resolves the registry row by primary or secondary key first.
    pub async fn materialize_by_key(&self, key: &str) -> IdentityResult<MaterializedIdentity> {
        let key = key.trim();
        if key.is_empty() {
            return Err(IdentityError::Invalid("registry key must not be empty".to_string()));
        }
        let row = self
            .registry
            .find_registry_row_by_key(key)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("registry key {key}")))?;
        self.materialize(row.id).await
    }

    /// Each key is independent; one failure never stops the rest.
    pub async fn materialize_many<S: AsRef<str>>(&self, keys: &[S]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for key in keys {
            let key = key.as_ref();
            match self.materialize_by_key(key).await {
                Ok(identity) => outcome.materialized.push(identity),
                Err(err) => {
                    warn!(key, error = %err, "materialization failed");
                    outcome.errors.insert(key.to_string(), err.to_string());
                }
            }
        }
        outcome
    }

    /// Refreshes identities that already exist for registry rows. Never creates new ones.
    pub async fn reconcile_existing(&self, batch_size: usize) -> IdentityResult<ReconcileReport> {
        let batch_size = batch_size.max(1);
        let mut report = ReconcileReport::default();
        let mut after_id = 0i64;

        loop {
            let rows = self.registry.list_registry_rows(after_id, batch_size).await?;
            let Some(last) = rows.last() else {
                break;
            };
            after_id = last.id;

            for row in &rows {
                match self.refresh_existing(row.id).await {
                    Ok(true) => report.updated += 1,
                    Ok(false) => report.skipped += 1,
                    Err(err) => {
                        warn!(registry_row_id = row.id, error = %err, "reconcile failed for row");
                        report.errors.insert(row.id, err.to_string());
                    }
                }
            }
            if rows.len() < batch_size {
                break;
            }
        }

        info!(
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors.len(),
            "identity reconciliation finished"
        );
        Ok(report)
    }

    async fn refresh_existing(&self, registry_row_id: i64) -> IdentityResult<bool> {
        let mut tx = self.identities.begin().await?;
        let result = refresh_in(tx.as_mut(), registry_row_id).await;
        finish(tx, result).await
    }
}

async fn refresh_in(tx: &mut dyn IdentityTx, registry_row_id: i64) -> IdentityResult<bool> {
    let Some(row) = tx.lock_registry_row(registry_row_id).await? else {
        return Ok(false);
    };
    match existing_identity(tx, &row).await? {
        Some(existing) => {
            tx.refresh_identity(existing.id, &profile_from_row(&row)).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Natural-keyed rows are found by key. Synthetic identities belong to the row that created them,
/// so a barcode moving between rows never hands one row's identity to another.
async fn existing_identity(tx: &mut dyn IdentityTx, row: &RegistryRow) -> IdentityResult<Option<MaterializedIdentity>> {
    Ok(match natural_key(row.primary_key.as_deref()) {
        Some(key) => tx.identity_by_natural_key(&key).await?,
        None => tx.synthetic_identity_for_row(row.id).await?,
    })
}

async fn new_identity(tx: &mut dyn IdentityTx, row: &RegistryRow) -> IdentityResult<NewIdentity> {
    let profile = profile_from_row(row);
    if let Some(key) = natural_key(row.primary_key.as_deref()) {
        return Ok(NewIdentity {
            credential_digest: derived_credential(&key),
            natural_key: key,
            synthetic_key: None,
            profile,
        });
    }

    let mut key = synthetic_key(row);
    if let Some(holder) = tx.identity_by_synthetic_key(&key).await? {
        warn!(
            registry_row_id = row.id,
            holder_row_id = holder.profile.registry_row_id,
            synthetic_key = %key,
            "barcode key already held by another row, keying by row id"
        );
        key = row_key(row.id);
    }
    debug!(registry_row_id = row.id, synthetic_key = %key, "no usable natural key, using synthetic key");
    Ok(NewIdentity {
        natural_key: key.clone(),
        synthetic_key: Some(key),
        credential_digest: random_credential(),
        profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use padron_core::{AccessStatus, RegistryRowDraft};
    use padron_storage::{MemoryStore, UpsertBatch};

    fn draft(primary: Option<&str>, secondary: Option<&str>, barcode: Option<&str>, name: &str) -> RegistryRowDraft {
        RegistryRowDraft {
            primary_key: primary.map(str::to_string),
            secondary_key: secondary.map(str::to_string),
            display_name: name.to_string(),
            external_barcode: barcode.map(str::to_string),
            balance: None,
            risk_flag: Some(1),
            last_unpaid_period: None,
            full_access_granted: true,
            controls_enabled: 0,
            controls_enabled_raw: None,
            raw_source: "{}".to_string(),
        }
    }

    async fn seeded(drafts: Vec<RegistryRowDraft>) -> (Arc<MemoryStore>, Materializer) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_registry_rows(&UpsertBatch {
                secondary: vec![],
                primary: drafts,
            })
            .await
            .unwrap();
        let materializer = Materializer::new(store.clone(), store.clone());
        (store, materializer)
    }

    #[tokio::test]
    async fn natural_key_identity_is_created_then_refreshed() {
        let (store, materializer) = seeded(vec![draft(Some("30.111.222"), None, None, "PEREZ, JUAN")]).await;

        let created = materializer.materialize(1).await.unwrap();
        assert_eq!(created.natural_key, "30111222");
        assert_eq!(created.synthetic_key, None);
        assert_eq!(created.profile.family_name, "PEREZ");
        assert_eq!(created.profile.given_name, "JUAN");
        assert_eq!(created.profile.access_status, AccessStatus::Active);
        assert_eq!(created.credential_digest, derived_credential("30111222"));

        store
            .upsert_registry_rows(&UpsertBatch {
                secondary: vec![],
                primary: vec![draft(Some("30.111.222"), None, None, "PEREZ, JUAN PABLO")],
            })
            .await
            .unwrap();
        let refreshed = materializer.materialize(1).await.unwrap();
        assert_eq!(refreshed.id, created.id);
        assert_eq!(refreshed.profile.given_name, "JUAN PABLO");
        assert_eq!(refreshed.credential_digest, created.credential_digest);
        assert_eq!(store.identity_count().await, 1);
    }

    #[tokio::test]
    async fn invalid_natural_key_falls_back_to_synthetic_keys() {
        let (store, materializer) = seeded(vec![
            draft(Some("00000000"), None, Some("777"), "CON, BARCODE"),
            draft(Some("99999999"), None, None, "SIN, NADA"),
        ])
        .await;

        let by_barcode = materializer.materialize(1).await.unwrap();
        assert_eq!(by_barcode.synthetic_key.as_deref(), Some("bc-777"));
        let by_row = materializer.materialize(2).await.unwrap();
        assert_eq!(by_row.synthetic_key.as_deref(), Some("row-2"));

        let again = materializer.materialize(1).await.unwrap();
        assert_eq!(again.id, by_barcode.id);
        assert_eq!(again.credential_digest, by_barcode.credential_digest);
        assert_eq!(store.identity_count().await, 2);
    }

    #[tokio::test]
    async fn synthetic_identity_stays_with_its_row_when_barcode_moves() {
        let (store, materializer) = seeded(vec![
            draft(Some("00000000"), None, Some("777"), "PRIMERO, A"),
            draft(Some("99999999"), None, None, "SEGUNDO, B"),
        ])
        .await;
        let first = materializer.materialize(1).await.unwrap();
        assert_eq!(first.synthetic_key.as_deref(), Some("bc-777"));

        store
            .upsert_registry_rows(&UpsertBatch {
                secondary: vec![],
                primary: vec![draft(Some("99999999"), None, Some("777"), "SEGUNDO, B")],
            })
            .await
            .unwrap();

        let second = materializer.materialize(2).await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.synthetic_key.as_deref(), Some("row-2"));
        assert_eq!(second.profile.registry_row_id, 2);
        assert_eq!(second.profile.external_barcode.as_deref(), Some("777"));

        let first_again = materializer.materialize(1).await.unwrap();
        assert_eq!(first_again.id, first.id);
        assert_eq!(first_again.synthetic_key.as_deref(), Some("bc-777"));
        assert_eq!(first_again.credential_digest, first.credential_digest);
        assert_eq!(first_again.profile.registry_row_id, 1);

        let second_again = materializer.materialize(2).await.unwrap();
        assert_eq!(second_again.id, second.id);
        assert_eq!(second_again.credential_digest, second.credential_digest);
        assert_eq!(store.identity_count().await, 2);
    }

    #[tokio::test]
    async fn unknown_row_is_not_found() {
        let (_, materializer) = seeded(vec![]).await;
        assert!(matches!(
            materializer.materialize(404).await,
            Err(IdentityError::NotFound(_))
        ));
        assert!(matches!(
            materializer.materialize_by_key("30111222").await,
            Err(IdentityError::NotFound(_))
        ));
        assert!(matches!(
            materializer.materialize_by_key("  ").await,
            Err(IdentityError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn batch_reports_failures_per_key() {
        let (_, materializer) = seeded(vec![draft(Some("30111222"), None, None, "PEREZ, JUAN")]).await;
        let outcome = materializer.materialize_many(&["30111222", "40111222"]).await;
        assert_eq!(outcome.materialized.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors.contains_key("40111222"));
    }

    #[tokio::test]
    async fn reconcile_only_touches_existing_identities() {
        let (store, materializer) = seeded(vec![
            draft(Some("30111222"), None, None, "A, A"),
            draft(Some("30111223"), None, None, "B, B"),
            draft(Some("30111224"), None, None, "C, C"),
        ])
        .await;
        materializer.materialize(2).await.unwrap();

        let report = materializer.reconcile_existing(2).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 2);
        assert!(report.errors.is_empty());
        assert_eq!(store.identity_count().await, 1);
    }
}
