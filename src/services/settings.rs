//! Global settings store.
//!
//! Plain key/value rows with a seeding lifecycle: defaults are inserted on
//! first boot (or on demand via `POST /settings/init`), read as a whole,
//! bulk-updated, or reset. Billing policy knobs are read through the typed
//! accessors below instead of ambient globals.

use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::table_service::{create_row, delete_row, list_rows, update_row};

pub const PRORATION_POLICY_KEY: &str = "billing.proration_policy";
pub const OVERDUE_GRACE_DAYS_KEY: &str = "billing.overdue_grace_days";
pub const AUTO_GENERATE_ON_ACTIVATION_KEY: &str = "billing.auto_generate_on_activation";

pub fn default_settings() -> Vec<(&'static str, Value)> {
    vec![
        (PRORATION_POLICY_KEY, json!("full_period")),
        (OVERDUE_GRACE_DAYS_KEY, json!(3)),
        (AUTO_GENERATE_ON_ACTIVATION_KEY, json!(true)),
        ("billing.default_cleaning_fee", json!(200.0)),
        ("billing.default_key_deposit", json!(100.0)),
        ("meters.electricity_unit_price", json!(1.0)),
        ("meters.cold_water_unit_price", json!(3.5)),
        ("meters.hot_water_unit_price", json!(25.0)),
        ("meters.gas_unit_price", json!(2.8)),
    ]
}

/// Insert any default setting that does not exist yet. Returns how many rows
/// were inserted; re-running is a no-op.
pub async fn seed_defaults(pool: &PgPool) -> Result<u32, AppError> {
    let existing = list_rows(pool, "settings", None, 500, 0, "setting_key", true).await?;
    let existing_keys = existing
        .iter()
        .map(|row| setting_key(row))
        .collect::<std::collections::HashSet<_>>();

    let mut inserted = 0u32;
    for (key, value) in default_settings() {
        if existing_keys.contains(key) {
            continue;
        }
        let mut payload = Map::new();
        payload.insert("setting_key".to_string(), Value::String(key.to_string()));
        payload.insert("setting_value".to_string(), value);
        payload.insert("scope".to_string(), Value::String("global".to_string()));
        create_row(pool, "settings", &payload).await?;
        inserted += 1;
    }

    if inserted > 0 {
        tracing::info!(inserted, "Seeded default settings");
    }
    Ok(inserted)
}

pub async fn get_all(pool: &PgPool) -> Result<Vec<Value>, AppError> {
    list_rows(pool, "settings", None, 500, 0, "setting_key", true).await
}

/// Upsert every provided key. Unknown keys are allowed; the store is a
/// generic key/value surface, policy readers validate on their side.
pub async fn bulk_update(
    pool: &PgPool,
    updates: &Map<String, Value>,
    scope: &str,
) -> Result<u32, AppError> {
    if updates.is_empty() {
        return Err(AppError::BadRequest("No settings to update.".to_string()));
    }

    let existing = list_rows(pool, "settings", None, 500, 0, "setting_key", true).await?;
    let mut id_by_key = std::collections::HashMap::new();
    for row in &existing {
        id_by_key.insert(setting_key(row), row_id(row));
    }

    let mut written = 0u32;
    for (key, value) in updates {
        if key.trim().is_empty() {
            return Err(AppError::BadRequest("Setting keys cannot be empty.".to_string()));
        }
        match id_by_key.get(key.as_str()).filter(|id| !id.is_empty()) {
            Some(id) => {
                let mut patch = Map::new();
                patch.insert("setting_value".to_string(), value.clone());
                patch.insert(
                    "updated_at".to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                );
                update_row(pool, "settings", id, &patch, "id").await?;
            }
            None => {
                let mut payload = Map::new();
                payload.insert("setting_key".to_string(), Value::String(key.clone()));
                payload.insert("setting_value".to_string(), value.clone());
                payload.insert("scope".to_string(), Value::String(scope.to_string()));
                create_row(pool, "settings", &payload).await?;
            }
        }
        written += 1;
    }

    Ok(written)
}

/// Drop every row and re-seed the defaults.
pub async fn reset_to_defaults(pool: &PgPool) -> Result<u32, AppError> {
    let existing = list_rows(pool, "settings", None, 500, 0, "setting_key", true).await?;
    for row in &existing {
        let id = row_id(row);
        if !id.is_empty() {
            delete_row(pool, "settings", &id, "id").await?;
        }
    }
    seed_defaults(pool).await
}

pub async fn get_value(pool: &PgPool, key: &str) -> Option<Value> {
    let mut filters = Map::new();
    filters.insert("setting_key".to_string(), Value::String(key.to_string()));
    let rows = list_rows(pool, "settings", Some(&filters), 1, 0, "setting_key", true)
        .await
        .ok()?;
    rows.first()
        .and_then(|row| row.as_object())
        .and_then(|obj| obj.get("setting_value"))
        .cloned()
}

pub async fn get_string(pool: &PgPool, key: &str, default: &str) -> String {
    match get_value(pool, key).await {
        Some(Value::String(text)) if !text.trim().is_empty() => text,
        _ => default.to_string(),
    }
}

pub async fn get_i64(pool: &PgPool, key: &str, default: i64) -> i64 {
    match get_value(pool, key).await {
        Some(Value::Number(number)) => number.as_i64().unwrap_or(default),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub async fn get_bool(pool: &PgPool, key: &str, default: bool) -> bool {
    match get_value(pool, key).await {
        Some(Value::Bool(flag)) => flag,
        Some(Value::String(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes"
        ),
        _ => default,
    }
}

fn setting_key(row: &Value) -> String {
    row.as_object()
        .and_then(|obj| obj.get("setting_key"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn row_id(row: &Value) -> String {
    row.as_object()
        .and_then(|obj| obj.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::{default_settings, OVERDUE_GRACE_DAYS_KEY, PRORATION_POLICY_KEY};

    #[test]
    fn defaults_cover_billing_policy() {
        let defaults = default_settings();
        let keys = defaults.iter().map(|(key, _)| *key).collect::<Vec<_>>();
        assert!(keys.contains(&PRORATION_POLICY_KEY));
        assert!(keys.contains(&OVERDUE_GRACE_DAYS_KEY));

        // Keys are unique; seeding must never insert a key twice.
        let mut deduped = keys.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), keys.len());
    }
}
