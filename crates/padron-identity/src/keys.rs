//! Identity key derivation and credential placeholders.

use padron_core::{AccessStatus, IdentityProfile, RegistryRow};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MIN_NATURAL_KEY_DIGITS: usize = 6;

/// Digits-only form of a primary key, or `None` when it is unusable as an identity key.
pub fn natural_key(primary_key: Option<&str>) -> Option<String> {
    let digits: String = primary_key?.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_NATURAL_KEY_DIGITS {
        return None;
    }
    // Placeholder documents such as 00000000 or 99999999.
    let first = digits.chars().next()?;
    if digits.chars().all(|c| c == first) {
        return None;
    }
    Some(digits)
}

/// Barcode-based when the row has one. Only used when creating an identity; lookups go by row.
pub fn synthetic_key(row: &RegistryRow) -> String {
    match row.external_barcode.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        Some(barcode) => format!("bc-{barcode}"),
        None => row_key(row.id),
    }
}

pub fn row_key(registry_row_id: i64) -> String {
    format!("row-{registry_row_id}")
}

/// Deterministic from the natural key, so it can be re-derived by whoever knows the key.
/// Weak on purpose: it is a placeholder to be rotated, never the only factor.
pub fn derived_credential(natural_key: &str) -> String {
    hex::encode(Sha256::digest(natural_key.as_bytes()))
}

pub fn random_credential() -> String {
    hex::encode(Sha256::digest(Uuid::new_v4().as_bytes()))
}

/// Splits `"FAMILY, GIVEN"`; without a comma the whole name is the family name.
pub fn split_display_name(display_name: &str) -> (String, String) {
    match display_name.split_once(',') {
        Some((family, given)) => (family.trim().to_string(), given.trim().to_string()),
        None => (display_name.trim().to_string(), String::new()),
    }
}

pub fn profile_from_row(row: &RegistryRow) -> IdentityProfile {
    let (family_name, given_name) = split_display_name(&row.display_name);
    IdentityProfile {
        registry_row_id: row.id,
        secondary_key: row.secondary_key.clone(),
        display_name: row.display_name.clone(),
        given_name,
        family_name,
        external_barcode: row.external_barcode.clone(),
        balance: row.balance,
        risk_flag: row.risk_flag,
        access_status: AccessStatus::from_full_access(row.full_access_granted),
    }
}
