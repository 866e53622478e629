//! Monetary normalization boundary.
//!
//! Monetary columns are Postgres `numeric` and arrive from the repository as
//! JSON numbers (or strings, depending on the driver path). Everything inside
//! the services does its math on `rust_decimal::Decimal`; rows are rewritten
//! to plain two-decimal JSON numbers exactly once, on the way out of a
//! handler. No route does its own ad-hoc conversion.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Number, Value};

pub const ROOM_MONEY_FIELDS: &[&str] = &["rent"];
pub const CONTRACT_MONEY_FIELDS: &[&str] = &[
    "monthly_rent",
    "total_rent",
    "deposit",
    "key_deposit",
    "cleaning_fee",
];
pub const BILL_MONEY_FIELDS: &[&str] = &["amount", "received_amount", "pending_amount"];
pub const METER_MONEY_FIELDS: &[&str] = &["unit_price"];
pub const READING_MONEY_FIELDS: &[&str] = &[
    "previous_reading",
    "current_reading",
    "usage_amount",
    "unit_price",
    "amount",
];
pub const BILL_DETAIL_MONEY_FIELDS: &[&str] = &["usage_amount", "unit_price", "amount"];

/// Parse a monetary JSON value into a `Decimal`. Missing, null, or garbage
/// values collapse to zero; storage enforces non-null where it matters.
pub fn decimal_from_value(value: Option<&Value>) -> Decimal {
    opt_decimal_from_value(value).unwrap_or_default()
}

/// Like `decimal_from_value`, but preserves absence (nullable columns such as
/// `key_deposit` and `previous_reading`).
pub fn opt_decimal_from_value(value: Option<&Value>) -> Option<Decimal> {
    match value {
        Some(Value::Number(number)) => number.to_string().parse::<Decimal>().ok(),
        Some(Value::String(text)) => text.trim().parse::<Decimal>().ok(),
        _ => None,
    }
}

/// Read a monetary field off a row object.
pub fn decimal_field(row: &Value, key: &str) -> Decimal {
    decimal_from_value(row.as_object().and_then(|obj| obj.get(key)))
}

pub fn opt_decimal_field(row: &Value, key: &str) -> Option<Decimal> {
    opt_decimal_from_value(row.as_object().and_then(|obj| obj.get(key)))
}

/// Convert a `Decimal` to the JSON number emitted at the serialization edge:
/// two decimal places, plain float.
pub fn to_json_number(amount: Decimal) -> Value {
    let rounded = amount.round_dp(2);
    Number::from_f64(rounded.to_f64().unwrap_or(0.0))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Rewrite the named monetary fields of a row as plain JSON numbers.
/// Null fields stay null.
pub fn normalize_money(row: &mut Value, fields: &[&str]) {
    let Some(obj) = row.as_object_mut() else {
        return;
    };
    for field in fields {
        let Some(current) = obj.get(*field) else {
            continue;
        };
        if current.is_null() {
            continue;
        }
        let normalized = opt_decimal_from_value(Some(current))
            .map(to_json_number)
            .unwrap_or(Value::Null);
        obj.insert((*field).to_string(), normalized);
    }
}

pub fn normalize_money_rows(rows: &mut [Value], fields: &[&str]) {
    for row in rows {
        normalize_money(row, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(text: &str) -> Decimal {
        text.parse().expect("valid decimal literal")
    }

    #[test]
    fn parses_numbers_and_strings() {
        assert_eq!(decimal_from_value(Some(&json!(3000.5))), dec("3000.5"));
        assert_eq!(decimal_from_value(Some(&json!("124.99"))), dec("124.99"));
        assert_eq!(decimal_from_value(Some(&json!(null))), Decimal::ZERO);
        assert_eq!(decimal_from_value(None), Decimal::ZERO);
    }

    #[test]
    fn preserves_absence_for_nullable_fields() {
        assert_eq!(opt_decimal_from_value(Some(&json!(null))), None);
        assert_eq!(
            opt_decimal_from_value(Some(&json!("500"))),
            Some(dec("500"))
        );
    }

    #[test]
    fn normalizes_monetary_fields_in_place() {
        let mut row = json!({
            "id": "b-1",
            "amount": "3000.004",
            "received_amount": 1000,
            "pending_amount": null,
            "remarks": "first month"
        });
        normalize_money(&mut row, BILL_MONEY_FIELDS);

        assert_eq!(row["amount"], json!(3000.0));
        assert_eq!(row["received_amount"], json!(1000.0));
        assert_eq!(row["pending_amount"], json!(null));
        assert_eq!(row["remarks"], json!("first month"));
    }

    #[test]
    fn decimal_sums_do_not_drift() {
        // 0.1 + 0.2 style accumulation stays exact in Decimal.
        let mut total = Decimal::ZERO;
        for _ in 0..10 {
            total += decimal_from_value(Some(&json!(0.1)));
        }
        assert_eq!(total, dec("1.0"));
        assert_eq!(to_json_number(total), json!(1.0));
    }
}
