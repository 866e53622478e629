//! Meter-reading / bill consistency checking and repair.
//!
//! A reading's `is_billed` flag and `status` must agree with the actual
//! `bill_details` linkage. Drift happens when a bill is deleted after
//! generation (stale billed flag, "orphaned") or when a detail was written
//! without the flag catching up ("inconsistent"). The validate pass is
//! read-only; the repair pass patches reading-by-reading and accumulates
//! errors instead of aborting.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::AppError;
use crate::repository::table_service::{count_rows, list_rows, update_row};

pub const READING_STATUSES: &[&str] = &["pending", "confirmed", "billed", "cancelled"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingBucket {
    ConsistentBilled,
    ConsistentUnbilled,
    Orphaned,
    Inconsistent,
}

/// Classify a reading against its actual bill-detail linkage.
pub fn classify(is_billed: bool, status: &str, linked_count: usize) -> ReadingBucket {
    let flagged_billed = is_billed || status == "billed";
    if linked_count == 0 {
        if flagged_billed {
            ReadingBucket::Orphaned
        } else {
            ReadingBucket::ConsistentUnbilled
        }
    } else if is_billed && status == "billed" {
        ReadingBucket::ConsistentBilled
    } else {
        ReadingBucket::Inconsistent
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    pub consistent_billed: usize,
    pub consistent_unbilled: usize,
    pub orphaned: Vec<Value>,
    pub inconsistent: Vec<Value>,
    pub dangling_contract: Vec<Value>,
    pub total_inconsistencies: usize,
}

/// Scan every reading and classify it. Side-effect free; safe to repeat.
pub async fn validate_reading_bill_consistency(
    pool: &PgPool,
) -> Result<ConsistencyReport, AppError> {
    let (readings, details, contracts) = tokio::try_join!(
        list_rows(pool, "meter_readings", None, 5000, 0, "reading_date", true),
        list_rows(pool, "bill_details", None, 5000, 0, "created_at", true),
        list_rows(pool, "contracts", None, 5000, 0, "created_at", true),
    )?;

    let mut linked_counts: HashMap<String, usize> = HashMap::new();
    for detail in &details {
        let reading_id = val_str(detail, "meter_reading_id");
        if !reading_id.is_empty() {
            *linked_counts.entry(reading_id).or_insert(0) += 1;
        }
    }

    let contract_ids = contracts
        .iter()
        .map(|contract| val_str(contract, "id"))
        .filter(|id| !id.is_empty())
        .collect::<HashSet<_>>();

    let mut report = ConsistencyReport::default();
    let mut flagged = Vec::new();

    for reading in readings {
        report.checked += 1;

        let reading_id = val_str(&reading, "id");
        let contract_id = val_str(&reading, "contract_id");
        if !contract_id.is_empty() && !contract_ids.contains(&contract_id) {
            report.dangling_contract.push(reading.clone());
        }

        let linked = linked_counts.get(&reading_id).copied().unwrap_or(0);
        let bucket = classify(
            val_bool(&reading, "is_billed"),
            &val_str(&reading, "status"),
            linked,
        );
        match bucket {
            ReadingBucket::ConsistentBilled => report.consistent_billed += 1,
            ReadingBucket::ConsistentUnbilled => report.consistent_unbilled += 1,
            ReadingBucket::Orphaned | ReadingBucket::Inconsistent => {
                flagged.push((bucket, reading, linked));
            }
        }
    }

    let enriched = enrich_readings(
        pool,
        flagged
            .iter()
            .map(|(_, reading, linked)| (reading.clone(), *linked))
            .collect(),
    )
    .await?;

    for ((bucket, _, _), reading) in flagged.iter().zip(enriched) {
        match bucket {
            ReadingBucket::Orphaned => report.orphaned.push(reading),
            ReadingBucket::Inconsistent => report.inconsistent.push(reading),
            _ => {}
        }
    }

    report.total_inconsistencies = report.orphaned.len() + report.inconsistent.len();
    Ok(report)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RepairError {
    pub reading_id: String,
    pub message: String,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct RepairOutcome {
    pub orphaned_repaired: u32,
    pub inconsistent_repaired: u32,
    pub errors: Vec<RepairError>,
}

/// Repair every flagged reading: orphans get their billed flag undone
/// (back to `confirmed`; a reading is only ever billed after confirmation),
/// inconsistent readings get the flag caught up to the real linkage.
pub async fn repair_reading_inconsistencies(pool: &PgPool) -> Result<RepairOutcome, AppError> {
    let report = validate_reading_bill_consistency(pool).await?;
    let mut outcome = RepairOutcome::default();

    for reading in &report.orphaned {
        let reading_id = val_str(reading, "id");
        let mut patch = Map::new();
        patch.insert("is_billed".to_string(), Value::Bool(false));
        patch.insert("status".to_string(), Value::String("confirmed".to_string()));
        match update_row(pool, "meter_readings", &reading_id, &patch, "id").await {
            Ok(_) => outcome.orphaned_repaired += 1,
            Err(error) => {
                warn!(%reading_id, error = %error, "Failed to repair orphaned reading");
                outcome.errors.push(RepairError {
                    reading_id,
                    message: error.to_string(),
                });
            }
        }
    }

    for reading in &report.inconsistent {
        let reading_id = val_str(reading, "id");
        let mut patch = Map::new();
        patch.insert("is_billed".to_string(), Value::Bool(true));
        patch.insert("status".to_string(), Value::String("billed".to_string()));
        match update_row(pool, "meter_readings", &reading_id, &patch, "id").await {
            Ok(_) => outcome.inconsistent_repaired += 1,
            Err(error) => {
                warn!(%reading_id, error = %error, "Failed to repair inconsistent reading");
                outcome.errors.push(RepairError {
                    reading_id,
                    message: error.to_string(),
                });
            }
        }
    }

    info!(
        orphaned_repaired = outcome.orphaned_repaired,
        inconsistent_repaired = outcome.inconsistent_repaired,
        errors = outcome.errors.len(),
        "Reading consistency repair completed"
    );

    Ok(outcome)
}

/// Reading counts per status, for the monitoring view.
pub async fn reading_status_stats(pool: &PgPool) -> Result<Value, AppError> {
    let mut by_status = Map::new();
    let mut total = 0i64;
    for status in READING_STATUSES {
        let mut filters = Map::new();
        filters.insert("status".to_string(), Value::String((*status).to_string()));
        let count = count_rows(pool, "meter_readings", Some(&filters)).await?;
        total += count;
        by_status.insert((*status).to_string(), Value::from(count));
    }

    let mut billed_filter = Map::new();
    billed_filter.insert("is_billed".to_string(), Value::Bool(true));
    let billed = count_rows(pool, "meter_readings", Some(&billed_filter)).await?;

    Ok(serde_json::json!({
        "total": total,
        "by_status": by_status,
        "billed_flagged": billed,
    }))
}

/// Attach meter, room, and renter context to flagged readings so the
/// operator report is readable without chasing ids.
async fn enrich_readings(
    pool: &PgPool,
    readings: Vec<(Value, usize)>,
) -> Result<Vec<Value>, AppError> {
    if readings.is_empty() {
        return Ok(Vec::new());
    }

    let meter_ids = extract_ids(readings.iter().map(|(reading, _)| reading), "meter_id");
    let contract_ids = extract_ids(readings.iter().map(|(reading, _)| reading), "contract_id");

    let (meters, contracts) = tokio::try_join!(
        fetch_by_ids(pool, "meters", &meter_ids),
        fetch_by_ids(pool, "contracts", &contract_ids),
    )?;

    let room_ids = extract_ids(meters.iter(), "room_id");
    let renter_ids = extract_ids(contracts.iter(), "renter_id");

    let (rooms, renters) = tokio::try_join!(
        fetch_by_ids(pool, "rooms", &room_ids),
        fetch_by_ids(pool, "renters", &renter_ids),
    )?;

    let meters_by_id = index_by_id(&meters);
    let contracts_by_id = index_by_id(&contracts);
    let rooms_by_id = index_by_id(&rooms);
    let renters_by_id = index_by_id(&renters);

    let mut enriched = Vec::with_capacity(readings.len());
    for (mut reading, linked) in readings {
        let meter = meters_by_id.get(&val_str(&reading, "meter_id"));
        let contract = contracts_by_id.get(&val_str(&reading, "contract_id"));
        let room = meter.and_then(|meter| rooms_by_id.get(&val_str(meter, "room_id")));
        let renter =
            contract.and_then(|contract| renters_by_id.get(&val_str(contract, "renter_id")));

        if let Some(obj) = reading.as_object_mut() {
            obj.insert("linked_bill_details".to_string(), Value::from(linked as i64));
            obj.insert(
                "meter_display_name".to_string(),
                opt_string(meter.map(|meter| val_str(meter, "display_name"))),
            );
            obj.insert(
                "room_number".to_string(),
                opt_string(room.map(|room| val_str(room, "room_number"))),
            );
            obj.insert(
                "renter_name".to_string(),
                opt_string(renter.map(|renter| val_str(renter, "name"))),
            );
            obj.insert(
                "contract_number".to_string(),
                opt_string(contract.map(|contract| val_str(contract, "contract_number"))),
            );
        }
        enriched.push(reading);
    }

    Ok(enriched)
}

async fn fetch_by_ids(
    pool: &PgPool,
    table: &str,
    ids: &HashSet<String>,
) -> Result<Vec<Value>, AppError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut filters = Map::new();
    filters.insert(
        "id".to_string(),
        Value::Array(ids.iter().cloned().map(Value::String).collect()),
    );
    list_rows(
        pool,
        table,
        Some(&filters),
        std::cmp::max(200, ids.len() as i64),
        0,
        "created_at",
        true,
    )
    .await
}

fn extract_ids<'a>(rows: impl Iterator<Item = &'a Value>, key: &str) -> HashSet<String> {
    rows.map(|row| val_str(row, key))
        .filter(|id| !id.is_empty())
        .collect()
}

fn index_by_id(rows: &[Value]) -> HashMap<String, &Value> {
    let mut index = HashMap::new();
    for row in rows {
        let id = val_str(row, "id");
        if !id.is_empty() {
            index.insert(id, row);
        }
    }
    index
}

fn opt_string(value: Option<String>) -> Value {
    value
        .filter(|text| !text.is_empty())
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn val_bool(row: &Value, key: &str) -> bool {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{classify, ReadingBucket};

    #[test]
    fn classifies_consistent_states() {
        assert_eq!(classify(true, "billed", 1), ReadingBucket::ConsistentBilled);
        assert_eq!(classify(true, "billed", 3), ReadingBucket::ConsistentBilled);
        assert_eq!(
            classify(false, "pending", 0),
            ReadingBucket::ConsistentUnbilled
        );
        assert_eq!(
            classify(false, "confirmed", 0),
            ReadingBucket::ConsistentUnbilled
        );
        assert_eq!(
            classify(false, "cancelled", 0),
            ReadingBucket::ConsistentUnbilled
        );
    }

    #[test]
    fn billed_flag_without_linkage_is_orphaned() {
        assert_eq!(classify(true, "billed", 0), ReadingBucket::Orphaned);
        // Either signal alone is enough; flag and status can drift apart.
        assert_eq!(classify(true, "confirmed", 0), ReadingBucket::Orphaned);
        assert_eq!(classify(false, "billed", 0), ReadingBucket::Orphaned);
    }

    #[test]
    fn linkage_without_billed_flag_is_inconsistent() {
        assert_eq!(classify(false, "confirmed", 1), ReadingBucket::Inconsistent);
        assert_eq!(classify(false, "pending", 2), ReadingBucket::Inconsistent);
        // Partial agreement still counts as drift.
        assert_eq!(classify(true, "confirmed", 1), ReadingBucket::Inconsistent);
        assert_eq!(classify(false, "billed", 1), ReadingBucket::Inconsistent);
    }

    #[test]
    fn repair_targets_restore_consistency() {
        // Orphaned repair: is_billed=false, status=confirmed.
        assert_eq!(
            classify(false, "confirmed", 0),
            ReadingBucket::ConsistentUnbilled
        );
        // Inconsistent repair: is_billed=true, status=billed.
        assert_eq!(classify(true, "billed", 1), ReadingBucket::ConsistentBilled);
    }
}
