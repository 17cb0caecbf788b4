//! On-demand identity materialization and association resolution.

use padron_storage::{IdentityTx, StoreError};
use thiserror::Error;
use tracing::warn;

mod keys;
mod materializer;
mod resolver;
mod tags;

pub use keys::{
    derived_credential, natural_key, profile_from_row, random_credential, row_key,
    split_display_name, synthetic_key,
};
pub use materializer::{BatchOutcome, Materializer, ReconcileReport};
pub use resolver::AssociationResolver;
pub use tags::TagAdmin;

pub const CRATE_NAME: &str = "padron-identity";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("not found: {0}")]
    NotFound(String),
    /// The id exists but belongs to another owner. Reported to callers as "not found".
    #[error("not owned by the requesting owner")]
    Ownership,
    #[error("registry row is not visible to the requesting owner")]
    Forbidden,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl IdentityError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::Ownership => 404,
            Self::Forbidden => 403,
            Self::Store(_) => 500,
            Self::Invalid(_) => 422,
        }
    }

    /// Safe to show to the caller: never names the real owner or internal failures.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound(_) | Self::Ownership => "not found".to_string(),
            Self::Forbidden => "forbidden".to_string(),
            Self::Store(_) => "internal error".to_string(),
            Self::Invalid(message) => message.clone(),
        }
    }
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// Commits on success, rolls back on failure. A failed rollback is logged, the original error wins.
pub(crate) async fn finish<T>(tx: Box<dyn IdentityTx>, result: IdentityResult<T>) -> IdentityResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_errors_look_like_not_found() {
        let foreign = IdentityError::Ownership;
        let missing = IdentityError::NotFound("association 9".to_string());
        assert_eq!(foreign.http_status(), missing.http_status());
        assert_eq!(foreign.public_message(), missing.public_message());
        assert_eq!(IdentityError::Forbidden.http_status(), 403);
        assert_eq!(IdentityError::Invalid("empty key".into()).http_status(), 422);
        assert_eq!(
            IdentityError::Store(StoreError::Corrupt("x".into())).public_message(),
            "internal error"
        );
    }
}
