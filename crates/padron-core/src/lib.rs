//! Core domain model for the member registry mirror.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "padron-core";

/// Cursor name holding the watermark of the last fully successful sync run.
pub const LAST_SYNC_CURSOR: &str = "padron_last_sync_at";

/// Wire format agreed with upstream: UTC, no offset suffix.
pub const WATERMARK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.format(WATERMARK_FORMAT).to_string()
}

/// Accepts RFC 3339 (any offset), naive `YYYY-MM-DDTHH:MM:SS` (read as UTC) or a bare date.
pub fn parse_watermark(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Some(at.with_timezone(&Utc));
    }
    for fmt in [WATERMARK_FORMAT, "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Column names of the canonical flat registry row.
pub mod columns {
    pub const PRIMARY_KEY: &str = "primary_key";
    pub const SECONDARY_KEY: &str = "secondary_key";
    pub const DISPLAY_NAME: &str = "display_name";
    pub const EXTERNAL_BARCODE: &str = "external_barcode";
    pub const BALANCE: &str = "balance";
    pub const RISK_FLAG: &str = "risk_flag";
    pub const LAST_UNPAID_PERIOD: &str = "last_unpaid_period";
    pub const FULL_ACCESS_GRANTED: &str = "full_access_granted";
    pub const CONTROLS_ENABLED: &str = "controls_enabled";
    pub const CONTROLS_ENABLED_RAW: &str = "controls_enabled_raw";
    pub const RAW_SOURCE: &str = "raw_source";

    /// Columns an upsert may overwrite. Keys are never part of the update set.
    pub const MUTABLE: [&str; 9] = [
        DISPLAY_NAME,
        EXTERNAL_BARCODE,
        BALANCE,
        RISK_FLAG,
        LAST_UNPAID_PERIOD,
        FULL_ACCESS_GRANTED,
        CONTROLS_ENABLED,
        CONTROLS_ENABLED_RAW,
        RAW_SOURCE,
    ];
}

/// Normalizer output: column name to scalar JSON value.
///
/// Nested values are a contract violation; [`FlatRow::structural_columns`] exposes them so the
/// sync engine can refuse the whole batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlatRow {
    values: BTreeMap<String, JsonValue>,
}

impl FlatRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: &str, value: JsonValue) {
        self.values.insert(column.to_string(), value);
    }

    pub fn with(mut self, column: &str, value: JsonValue) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.values.get(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn structural_columns(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_array() || v.is_object())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn primary_key(&self) -> Option<String> {
        self.text(columns::PRIMARY_KEY)
    }

    pub fn secondary_key(&self) -> Option<String> {
        self.text(columns::SECONDARY_KEY)
    }

    fn text(&self, column: &str) -> Option<String> {
        match self.values.get(column)? {
            JsonValue::Null => None,
            JsonValue::String(s) => non_empty(s),
            other => non_empty(&other.to_string()),
        }
    }

    fn decimal(&self, column: &str) -> Option<Decimal> {
        match self.values.get(column)? {
            JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
            JsonValue::Number(n) => Decimal::from_str(&n.to_string())
                .ok()
                .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
            _ => None,
        }
    }

    fn int(&self, column: &str) -> Option<i64> {
        match self.values.get(column)? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            JsonValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn flag(&self, column: &str) -> bool {
        matches!(self.values.get(column), Some(JsonValue::Bool(true)))
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Why the normalizer refused a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRejection {
    NoNaturalKey,
    NotAnObject,
}

impl RowRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoNaturalKey => "no_natural_key",
            Self::NotAnObject => "not_an_object",
        }
    }
}

impl fmt::Display for RowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Accepted(FlatRow),
    Rejected(RowRejection),
}

/// Which natural key an upsert is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySpace {
    Secondary,
    Primary,
}

impl KeySpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Secondary => "secondary",
            Self::Primary => "primary",
        }
    }
}

/// Typed upsert payload derived from a verified [`FlatRow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRowDraft {
    pub primary_key: Option<String>,
    pub secondary_key: Option<String>,
    pub display_name: String,
    pub external_barcode: Option<String>,
    pub balance: Option<Decimal>,
    pub risk_flag: Option<i16>,
    pub last_unpaid_period: Option<i32>,
    pub full_access_granted: bool,
    pub controls_enabled: i32,
    pub controls_enabled_raw: Option<String>,
    pub raw_source: String,
}

impl RegistryRowDraft {
    pub fn from_flat(row: &FlatRow) -> Result<Self, RowRejection> {
        let primary_key = row.primary_key();
        let secondary_key = row.secondary_key();
        if primary_key.is_none() && secondary_key.is_none() {
            return Err(RowRejection::NoNaturalKey);
        }
        Ok(Self {
            primary_key,
            secondary_key,
            display_name: row.text(columns::DISPLAY_NAME).unwrap_or_default(),
            external_barcode: row.text(columns::EXTERNAL_BARCODE),
            balance: row.decimal(columns::BALANCE),
            risk_flag: row
                .int(columns::RISK_FLAG)
                .and_then(|v| i16::try_from(v).ok()),
            last_unpaid_period: row
                .int(columns::LAST_UNPAID_PERIOD)
                .and_then(|v| i32::try_from(v).ok()),
            full_access_granted: row.flag(columns::FULL_ACCESS_GRANTED),
            controls_enabled: row
                .int(columns::CONTROLS_ENABLED)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0),
            controls_enabled_raw: row.text(columns::CONTROLS_ENABLED_RAW),
            raw_source: row.text(columns::RAW_SOURCE).unwrap_or_else(|| "{}".to_string()),
        })
    }

    /// Rows with a secondary key always match on it; the primary key is only a fallback.
    pub fn key_space(&self) -> KeySpace {
        if self.secondary_key.is_some() {
            KeySpace::Secondary
        } else {
            KeySpace::Primary
        }
    }

    pub fn match_key(&self) -> &str {
        match self.key_space() {
            KeySpace::Secondary => self.secondary_key.as_deref().unwrap_or_default(),
            KeySpace::Primary => self.primary_key.as_deref().unwrap_or_default(),
        }
    }
}

/// One registry record as mirrored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRow {
    pub id: i64,
    pub primary_key: Option<String>,
    pub secondary_key: Option<String>,
    pub display_name: String,
    pub external_barcode: Option<String>,
    pub balance: Option<Decimal>,
    pub risk_flag: Option<i16>,
    pub last_unpaid_period: Option<i32>,
    pub full_access_granted: bool,
    pub controls_enabled: i32,
    pub controls_enabled_raw: Option<String>,
    pub raw_source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub name: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Active,
    Inactive,
}

impl AccessStatus {
    pub fn from_full_access(granted: bool) -> Self {
        if granted {
            Self::Active
        } else {
            Self::Inactive
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Denormalized fields copied from a registry row on every materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub registry_row_id: i64,
    pub secondary_key: Option<String>,
    pub display_name: String,
    pub given_name: String,
    pub family_name: String,
    pub external_barcode: Option<String>,
    pub balance: Option<Decimal>,
    pub risk_flag: Option<i16>,
    pub access_status: AccessStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIdentity {
    pub natural_key: String,
    pub synthetic_key: Option<String>,
    pub credential_digest: String,
    pub profile: IdentityProfile,
}

/// Canonical local identity mirrored from a registry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedIdentity {
    pub id: i64,
    pub natural_key: String,
    pub synthetic_key: Option<String>,
    pub profile: IdentityProfile,
    #[serde(skip_serializing, default)]
    pub credential_digest: String,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStatus {
    Active,
    Ended,
}

impl AssociationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// Directed owner -> subject relationship. At most one per ordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub id: i64,
    pub owner_id: i64,
    pub subject_id: i64,
    pub status: AssociationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn watermark_inputs_normalize_to_utc_without_offset() {
        let expected = Utc.with_ymd_and_hms(2026, 2, 1, 3, 0, 0).single().unwrap();
        assert_eq!(parse_watermark("2026-02-01T00:00:00-03:00"), Some(expected));
        assert_eq!(parse_watermark("2026-02-01T03:00:00"), Some(expected));
        assert_eq!(parse_watermark("2026-02-01T03:00:00Z"), Some(expected));
        assert_eq!(
            parse_watermark("2026-02-01"),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single()
        );
        assert_eq!(parse_watermark("yesterday"), None);
        assert_eq!(format_watermark(expected), "2026-02-01T03:00:00");
    }

    #[test]
    fn flat_row_reports_nested_values() {
        let row = FlatRow::new()
            .with(columns::PRIMARY_KEY, json!("30111222"))
            .with(columns::DISPLAY_NAME, json!(["PEREZ", "JUAN"]))
            .with(columns::RAW_SOURCE, json!("{\"dni\":\"30111222\"}"));
        assert_eq!(row.structural_columns(), vec![columns::DISPLAY_NAME]);
    }

    #[test]
    fn draft_prefers_secondary_key_space() {
        let row = FlatRow::new()
            .with(columns::PRIMARY_KEY, json!("30111222"))
            .with(columns::SECONDARY_KEY, json!("  A-77 "))
            .with(columns::BALANCE, json!("-1500.50"))
            .with(columns::RISK_FLAG, json!(2))
            .with(columns::FULL_ACCESS_GRANTED, json!(true));
        let draft = RegistryRowDraft::from_flat(&row).unwrap();
        assert_eq!(draft.key_space(), KeySpace::Secondary);
        assert_eq!(draft.match_key(), "A-77");
        assert_eq!(draft.balance, Some(Decimal::new(-150050, 2)));
        assert_eq!(draft.risk_flag, Some(2));
        assert!(draft.full_access_granted);
        assert_eq!(draft.controls_enabled, 0);
    }

    #[test]
    fn draft_without_keys_is_rejected() {
        let row = FlatRow::new()
            .with(columns::PRIMARY_KEY, json!("   "))
            .with(columns::SECONDARY_KEY, JsonValue::Null);
        assert_eq!(
            RegistryRowDraft::from_flat(&row),
            Err(RowRejection::NoNaturalKey)
        );
    }
}
