//! Raw registry record -> canonical flat row.
//!
//! Never fails on malformed values: unusable numerics become `null`, an unusable control flag
//! becomes `0`. Only a record without any natural key (or not an object at all) is rejected.

use std::str::FromStr;

use padron_core::{columns, FlatRow, NormalizeOutcome, RowRejection};
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

pub trait RowNormalizer: Send + Sync {
    fn normalize(&self, raw: &JsonValue) -> NormalizeOutcome;
}

/// Field names of the upstream padron feed.
mod fields {
    pub const PRIMARY_KEY: &str = "dni";
    pub const SECONDARY_KEY: &str = "sid";
    pub const FULL_NAME: &str = "apynom";
    pub const FAMILY_NAME: &str = "apellido";
    pub const GIVEN_NAME: &str = "nombre";
    pub const BARCODE: &str = "barcode";
    pub const BALANCE: &str = "saldo";
    pub const RISK_FLAG: &str = "semaforo";
    pub const LAST_UNPAID: &str = "ult_impago";
    pub const FULL_ACCESS: &str = "acceso_full";
    pub const CONTROLS: &str = "hab_controles";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PadronNormalizer;

impl RowNormalizer for PadronNormalizer {
    fn normalize(&self, raw: &JsonValue) -> NormalizeOutcome {
        let Some(record) = raw.as_object() else {
            return NormalizeOutcome::Rejected(RowRejection::NotAnObject);
        };

        let primary_key = key_text(record, fields::PRIMARY_KEY);
        let secondary_key = key_text(record, fields::SECONDARY_KEY);
        if primary_key.is_none() && secondary_key.is_none() {
            return NormalizeOutcome::Rejected(RowRejection::NoNaturalKey);
        }

        let (controls, controls_raw) = normalize_controls(record.get(fields::CONTROLS));

        let row = FlatRow::new()
            .with(columns::PRIMARY_KEY, opt_string(primary_key))
            .with(columns::SECONDARY_KEY, opt_string(secondary_key))
            .with(columns::DISPLAY_NAME, JsonValue::String(display_name(record)))
            .with(columns::EXTERNAL_BARCODE, opt_string(scalar_text(record.get(fields::BARCODE))))
            .with(columns::BALANCE, opt_string(decimal(record.get(fields::BALANCE)).map(|d| d.to_string())))
            .with(columns::RISK_FLAG, opt_int(integer(record.get(fields::RISK_FLAG))))
            .with(columns::LAST_UNPAID_PERIOD, opt_int(integer(record.get(fields::LAST_UNPAID))))
            .with(columns::FULL_ACCESS_GRANTED, JsonValue::Bool(flag(record.get(fields::FULL_ACCESS))))
            .with(columns::CONTROLS_ENABLED, JsonValue::from(controls))
            .with(columns::CONTROLS_ENABLED_RAW, opt_string(controls_raw))
            .with(columns::RAW_SOURCE, JsonValue::String(compact(raw)));
        NormalizeOutcome::Accepted(row)
    }
}

/// `hab_controles` policy. Returns the normalized 0/n value and the JSON encoding of the input.
pub fn normalize_controls(value: Option<&JsonValue>) -> (i32, Option<String>) {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return (0, None);
    };
    let raw = Some(compact(value));
    let normalized = match value {
        JsonValue::Array(items) if items.is_empty() => 0,
        JsonValue::Object(map) if map.is_empty() => 0,
        JsonValue::Array(_) | JsonValue::Object(_) => {
            warn!(value = %compact(value), "structured hab_controles from upstream, treating as 0");
            0
        }
        JsonValue::Bool(b) => i32::from(*b),
        JsonValue::Number(_) | JsonValue::String(_) => match integer(Some(value)).and_then(|v| i32::try_from(v).ok()) {
            Some(v) => v,
            None => {
                warn!(value = %compact(value), "non-numeric hab_controles, treating as 0");
                0
            }
        },
        JsonValue::Null => 0,
    };
    (normalized, raw)
}

fn compact(value: &JsonValue) -> String {
    // Serializing a `Value` cannot fail.
    serde_json::to_string(value).unwrap_or_default()
}

fn opt_string(value: Option<String>) -> JsonValue {
    value.map(JsonValue::String).unwrap_or(JsonValue::Null)
}

fn opt_int(value: Option<i64>) -> JsonValue {
    value.map(JsonValue::from).unwrap_or(JsonValue::Null)
}

fn trimmed(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn key_text(record: &Map<String, JsonValue>, field: &str) -> Option<String> {
    match record.get(field)? {
        JsonValue::String(s) => trimmed(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Null => None,
        other => {
            warn!(field, value = %compact(other), "ignoring non-scalar key value");
            None
        }
    }
}

/// Scalars as text; nested values as compact JSON so the row stays flat.
fn scalar_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => trimmed(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        nested => Some(compact(nested)),
    }
}

fn display_name(record: &Map<String, JsonValue>) -> String {
    if let Some(full) = scalar_text(record.get(fields::FULL_NAME)) {
        return full;
    }
    let family = scalar_text(record.get(fields::FAMILY_NAME));
    let given = scalar_text(record.get(fields::GIVEN_NAME));
    match (family, given) {
        (Some(family), Some(given)) => format!("{family}, {given}"),
        (Some(only), None) | (None, Some(only)) => only,
        (None, None) => String::new(),
    }
}

fn decimal(value: Option<&JsonValue>) -> Option<Decimal> {
    match value? {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        JsonValue::String(s) => {
            let s = s.trim();
            Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
        }
        _ => None,
    }
}

/// Integers pass through, floats and decimal strings truncate toward zero.
fn integer(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn flag(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64() == Some(1),
        Some(JsonValue::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true"),
        _ => false,
    }
}
