use std::sync::Arc;

use padron_core::Association;
use padron_storage::{IdentityStore, IdentityTx};
use tracing::{debug, info, info_span, Instrument};

use crate::materializer::Materializer;
use crate::{finish, IdentityError, IdentityResult};

/// Maps a client-held id to the canonical association for an owner.
///
/// Clients may hold either an association id or a registry row id, depending on which screen
/// produced it. Association ids are tried first.
#[derive(Clone)]
pub struct AssociationResolver {
    identities: Arc<dyn IdentityStore>,
    materializer: Materializer,
}

impl AssociationResolver {
    pub fn new(identities: Arc<dyn IdentityStore>, materializer: Materializer) -> Self {
        Self {
            identities,
            materializer,
        }
    }

    pub async fn resolve(&self, incoming_id: i64, owner_id: i64) -> IdentityResult<Association> {
        let span = info_span!("resolve_association", incoming_id, owner_id);
        async {
            let mut tx = self.identities.begin().await?;
            let result = self.resolve_in(tx.as_mut(), incoming_id, owner_id).await;
            finish(tx, result).await
        }
        .instrument(span)
        .await
    }

    async fn resolve_in(
        &self,
        tx: &mut dyn IdentityTx,
        incoming_id: i64,
        owner_id: i64,
    ) -> IdentityResult<Association> {
        if let Some(existing) = tx.association_by_id(incoming_id).await? {
            if existing.owner_id != owner_id {
                debug!("association id belongs to another owner");
                return Err(IdentityError::Ownership);
            }
            return Ok(existing);
        }

        if !tx.registry_row_exists(incoming_id).await? {
            return Err(IdentityError::NotFound(format!("association or registry row {incoming_id}")));
        }
        if !tx.is_row_tagged(owner_id, incoming_id).await? {
            return Err(IdentityError::Forbidden);
        }

        let identity = self.materializer.materialize_in(tx, incoming_id).await?;
        let association = tx.activate_association(owner_id, identity.id).await?;
        info!(
            association_id = association.id,
            subject_id = identity.id,
            "association resolved from registry row"
        );
        Ok(association)
    }

    /// Soft-ends an association. Ending an already ended one keeps its original end time.
    pub async fn end(&self, association_id: i64, owner_id: i64) -> IdentityResult<Association> {
        let mut tx = self.identities.begin().await?;
        let result = end_in(tx.as_mut(), association_id, owner_id).await;
        finish(tx, result).await
    }
}

async fn end_in(tx: &mut dyn IdentityTx, association_id: i64, owner_id: i64) -> IdentityResult<Association> {
    let existing = tx
        .association_by_id(association_id)
        .await?
        .ok_or_else(|| IdentityError::NotFound(format!("association {association_id}")))?;
    if existing.owner_id != owner_id {
        return Err(IdentityError::Ownership);
    }
    let ended = tx.end_association(association_id).await?;
    info!(association_id, owner_id, "association ended");
    Ok(ended)
}
