use std::sync::Arc;

use padron_storage::{StoreError, TagDiff, TagStore};
use tracing::info;

use crate::{IdentityError, IdentityResult};

/// Maintains which registry rows each owner may resolve.
#[derive(Clone)]
pub struct TagAdmin {
    tags: Arc<dyn TagStore>,
}

impl TagAdmin {
    pub fn new(tags: Arc<dyn TagStore>) -> Self {
        Self { tags }
    }

    pub async fn tag(&self, owner_id: i64, row_id: i64, assigned_by: Option<i64>) -> IdentityResult<bool> {
        self.tags
            .tag_registry_row(owner_id, row_id, assigned_by)
            .await
            .map_err(not_found)
    }

    pub async fn untag(&self, owner_id: i64, row_id: i64) -> IdentityResult<bool> {
        Ok(self.tags.untag_registry_row(owner_id, row_id).await?)
    }

    /// Makes `row_ids` the owner's exact tag set. Unknown row ids reject the whole call.
    pub async fn replace_tags(&self, owner_id: i64, row_ids: &[i64], assigned_by: Option<i64>) -> IdentityResult<TagDiff> {
        let diff = self
            .tags
            .replace_tags(owner_id, row_ids, assigned_by)
            .await
            .map_err(not_found)?;
        info!(
            owner_id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "owner tags replaced"
        );
        Ok(diff)
    }

    pub async fn list_tagged(&self, owner_id: i64) -> IdentityResult<Vec<i64>> {
        Ok(self.tags.list_tagged(owner_id).await?)
    }
}

fn not_found(err: StoreError) -> IdentityError {
    match err {
        StoreError::NotFound(what) => IdentityError::NotFound(what),
        other => IdentityError::Store(other),
    }
}
