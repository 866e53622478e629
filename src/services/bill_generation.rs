//! Automatic bill generation for activated contracts.
//!
//! Given a contract, produces the deterministic bill set its terms imply:
//! one rent bill per billing period over the term, plus deposit, key-deposit
//! and cleaning-fee bills when present. Generation is idempotent per
//! contract: a planned bill whose (type, due date) already exists is
//! skipped, so activation, the manual regenerate endpoint and concurrent
//! callers can all invoke it safely.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::AppError;
use crate::money;
use crate::repository::table_service::{create_row, get_row, list_rows, update_row};
use crate::services::settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrationPolicy {
    /// The trailing partial period is billed at the full period amount.
    FullPeriod,
    /// The trailing partial period is billed by days covered.
    Daily,
}

impl ProrationPolicy {
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Self::Daily,
            _ => Self::FullPeriod,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedBill {
    pub bill_type: String,
    pub due_date: NaiveDate,
    pub amount: Decimal,
    pub remarks: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedBill {
    pub bill_type: String,
    pub due_date: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub created: Vec<Value>,
    pub skipped: u32,
    pub failed: Vec<FailedBill>,
}

/// Generate the bill set for a contract. Fails hard only when the contract
/// is missing or its dates are unreadable; a persistence failure for one
/// bill is reported in `failed` without discarding the others.
pub async fn generate_bills_for_contract(
    pool: &PgPool,
    contract_id: &str,
) -> Result<GenerationOutcome, AppError> {
    let contract = get_row(pool, "contracts", contract_id, "id").await?;

    let policy_raw = settings::get_string(pool, settings::PRORATION_POLICY_KEY, "full_period").await;
    let policy = ProrationPolicy::from_setting(&policy_raw);

    let plan = plan_contract_bills(&contract, policy)?;

    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(contract_id.to_string()),
    );
    let existing = list_rows(pool, "bills", Some(&filters), 1000, 0, "due_date", true).await?;

    let existing_keys = existing
        .iter()
        .map(|bill| (val_str(bill, "bill_type"), val_str(bill, "due_date")))
        .collect::<HashSet<_>>();

    let mut sequence_by_type: HashMap<String, u32> = HashMap::new();
    for bill in &existing {
        *sequence_by_type
            .entry(val_str(bill, "bill_type"))
            .or_insert(0) += 1;
    }

    let contract_number = val_str(&contract, "contract_number");
    let mut outcome = GenerationOutcome::default();

    for planned in plan {
        let key = (planned.bill_type.clone(), planned.due_date.to_string());
        if existing_keys.contains(&key) {
            outcome.skipped += 1;
            continue;
        }

        let sequence = sequence_by_type
            .entry(planned.bill_type.clone())
            .or_insert(0);
        *sequence += 1;
        let bill_number = format_bill_number(&contract_number, &planned.bill_type, *sequence);

        let mut payload = Map::new();
        payload.insert(
            "bill_number".to_string(),
            Value::String(bill_number.clone()),
        );
        payload.insert(
            "contract_id".to_string(),
            Value::String(contract_id.to_string()),
        );
        payload.insert(
            "bill_type".to_string(),
            Value::String(planned.bill_type.clone()),
        );
        payload.insert("amount".to_string(), money::to_json_number(planned.amount));
        payload.insert(
            "received_amount".to_string(),
            money::to_json_number(Decimal::ZERO),
        );
        payload.insert(
            "pending_amount".to_string(),
            money::to_json_number(planned.amount),
        );
        payload.insert(
            "due_date".to_string(),
            Value::String(planned.due_date.to_string()),
        );
        payload.insert("status".to_string(), Value::String("pending".to_string()));
        payload.insert("remarks".to_string(), Value::String(planned.remarks.clone()));

        match create_row(pool, "bills", &payload).await {
            Ok(created) => outcome.created.push(created),
            Err(error) => {
                warn!(
                    contract_id,
                    %bill_number,
                    error = %error,
                    "Failed to persist generated bill"
                );
                outcome.failed.push(FailedBill {
                    bill_type: planned.bill_type,
                    due_date: planned.due_date.to_string(),
                    message: error.to_string(),
                });
            }
        }
    }

    info!(
        contract_id,
        created = outcome.created.len(),
        skipped = outcome.skipped,
        failed = outcome.failed.len(),
        "Bill generation completed"
    );

    Ok(outcome)
}

/// Build the planned bill set from contract terms. Pure; no persistence.
pub fn plan_contract_bills(
    contract: &Value,
    policy: ProrationPolicy,
) -> Result<Vec<PlannedBill>, AppError> {
    let start = parse_date(&val_str(contract, "start_date"))
        .ok_or_else(|| AppError::BadRequest("Contract start_date is not a valid date.".to_string()))?;
    let end = parse_date(&val_str(contract, "end_date"))
        .ok_or_else(|| AppError::BadRequest("Contract end_date is not a valid date.".to_string()))?;
    if end < start {
        return Err(AppError::BadRequest(
            "Contract end_date is before start_date.".to_string(),
        ));
    }

    let monthly_rent = money::decimal_field(contract, "monthly_rent");
    let months_per_period = payment_timing_months(&val_str(contract, "payment_timing"));

    let mut planned = Vec::new();

    if monthly_rent > Decimal::ZERO {
        for period in rent_periods(start, end, months_per_period, monthly_rent, policy) {
            planned.push(period);
        }
    }

    let deposit = money::decimal_field(contract, "deposit");
    if deposit > Decimal::ZERO {
        planned.push(PlannedBill {
            bill_type: "deposit".to_string(),
            due_date: start,
            amount: deposit,
            remarks: "Security deposit".to_string(),
        });
    }

    if let Some(key_deposit) = money::opt_decimal_field(contract, "key_deposit") {
        if key_deposit > Decimal::ZERO {
            planned.push(PlannedBill {
                bill_type: "key_deposit".to_string(),
                due_date: start,
                amount: key_deposit,
                remarks: "Key deposit".to_string(),
            });
        }
    }

    if let Some(cleaning_fee) = money::opt_decimal_field(contract, "cleaning_fee") {
        if cleaning_fee > Decimal::ZERO {
            planned.push(PlannedBill {
                bill_type: "cleaning".to_string(),
                due_date: start,
                amount: cleaning_fee,
                remarks: "Cleaning fee".to_string(),
            });
        }
    }

    Ok(planned)
}

/// One rent bill per billing period, due at each period start. The trailing
/// partial period is billed per the proration policy.
fn rent_periods(
    start: NaiveDate,
    end: NaiveDate,
    months_per_period: u32,
    monthly_rent: Decimal,
    policy: ProrationPolicy,
) -> Vec<PlannedBill> {
    let full_amount = monthly_rent * Decimal::from(months_per_period);
    let mut periods = Vec::new();
    let mut cursor = start;

    while cursor <= end {
        let next_start = add_months(cursor, months_per_period);
        let natural_end = next_start - Duration::days(1);
        let covered_end = natural_end.min(end);

        let amount = if natural_end <= end {
            full_amount
        } else {
            match policy {
                ProrationPolicy::FullPeriod => full_amount,
                ProrationPolicy::Daily => {
                    let period_days = (natural_end - cursor).num_days() + 1;
                    let covered_days = (covered_end - cursor).num_days() + 1;
                    full_amount * Decimal::from(covered_days) / Decimal::from(period_days)
                }
            }
        };

        periods.push(PlannedBill {
            bill_type: "rent".to_string(),
            due_date: cursor,
            amount: amount.round_dp(2),
            remarks: format!("Rent {cursor} to {covered_end}"),
        });

        cursor = next_start;
    }

    periods
}

#[derive(Debug, Default, serde::Serialize)]
pub struct OverdueOutcome {
    pub marked_overdue: u32,
    pub rooms_flagged: u32,
    pub errors: u32,
}

/// Mark pending bills past their due date (plus the configured grace period)
/// as overdue, and flag the rooms of the owning active contracts.
pub async fn refresh_overdue_bills(pool: &PgPool) -> Result<OverdueOutcome, AppError> {
    let grace_days = settings::get_i64(pool, settings::OVERDUE_GRACE_DAYS_KEY, 3).await;
    let cutoff = Utc::now().date_naive() - Duration::days(grace_days.max(0));

    let mut filters = Map::new();
    filters.insert("status".to_string(), Value::String("pending".to_string()));
    filters.insert("due_date__lt".to_string(), Value::String(cutoff.to_string()));

    let bills = list_rows(pool, "bills", Some(&filters), 2000, 0, "due_date", true).await?;

    let mut outcome = OverdueOutcome::default();
    let mut contract_ids = HashSet::new();

    for bill in &bills {
        let bill_id = val_str(bill, "id");
        if bill_id.is_empty() {
            continue;
        }

        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::String("overdue".to_string()));
        match update_row(pool, "bills", &bill_id, &patch, "id").await {
            Ok(_) => {
                outcome.marked_overdue += 1;
                let contract_id = val_str(bill, "contract_id");
                if !contract_id.is_empty() {
                    contract_ids.insert(contract_id);
                }
            }
            Err(error) => {
                warn!(%bill_id, error = %error, "Failed to mark bill overdue");
                outcome.errors += 1;
            }
        }
    }

    for contract_id in contract_ids {
        let Ok(contract) = get_row(pool, "contracts", &contract_id, "id").await else {
            continue;
        };
        if val_str(&contract, "status") != "active" {
            continue;
        }
        let room_id = val_str(&contract, "room_id");
        if room_id.is_empty() {
            continue;
        }
        let Ok(room) = get_row(pool, "rooms", &room_id, "id").await else {
            continue;
        };
        if val_str(&room, "status") != "occupied" {
            continue;
        }
        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::String("overdue".to_string()));
        if update_row(pool, "rooms", &room_id, &patch, "id").await.is_ok() {
            outcome.rooms_flagged += 1;
        } else {
            outcome.errors += 1;
        }
    }

    info!(
        marked_overdue = outcome.marked_overdue,
        rooms_flagged = outcome.rooms_flagged,
        errors = outcome.errors,
        "Overdue refresh completed"
    );

    Ok(outcome)
}

#[derive(Debug, Default, serde::Serialize)]
pub struct UtilityBillOutcome {
    pub bill: Option<Value>,
    pub readings_billed: u32,
    pub errors: Vec<String>,
}

/// Roll every confirmed, unbilled reading of a contract into one utility
/// bill. Each reading gets a bill-detail line and its billed flag/status
/// flipped; a reading that fails to flip is reported and left for the
/// consistency repair to catch up.
pub async fn generate_utility_bill(
    pool: &PgPool,
    contract_id: &str,
) -> Result<UtilityBillOutcome, AppError> {
    let contract = get_row(pool, "contracts", contract_id, "id").await?;

    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(contract_id.to_string()),
    );
    filters.insert("status".to_string(), Value::String("confirmed".to_string()));
    filters.insert("is_billed".to_string(), Value::Bool(false));
    let readings = list_rows(
        pool,
        "meter_readings",
        Some(&filters),
        500,
        0,
        "reading_date",
        true,
    )
    .await?;

    if readings.is_empty() {
        return Ok(UtilityBillOutcome::default());
    }

    let meter_ids = readings
        .iter()
        .map(|reading| val_str(reading, "meter_id"))
        .filter(|id| !id.is_empty())
        .collect::<HashSet<_>>();
    let mut meter_filters = Map::new();
    meter_filters.insert(
        "id".to_string(),
        Value::Array(meter_ids.into_iter().map(Value::String).collect()),
    );
    let meters = list_rows(pool, "meters", Some(&meter_filters), 200, 0, "sort_order", true).await?;
    let mut meter_type_by_id = HashMap::new();
    for meter in &meters {
        meter_type_by_id.insert(val_str(meter, "id"), val_str(meter, "meter_type"));
    }

    let total = readings
        .iter()
        .map(|reading| money::decimal_field(reading, "amount"))
        .sum::<Decimal>();

    let mut count_filter = Map::new();
    count_filter.insert(
        "contract_id".to_string(),
        Value::String(contract_id.to_string()),
    );
    count_filter.insert("bill_type".to_string(), Value::String("utility".to_string()));
    let existing_utility =
        list_rows(pool, "bills", Some(&count_filter), 1000, 0, "due_date", true).await?;

    let bill_number = format_bill_number(
        &val_str(&contract, "contract_number"),
        "utility",
        existing_utility.len() as u32 + 1,
    );

    let mut bill_payload = Map::new();
    bill_payload.insert("bill_number".to_string(), Value::String(bill_number));
    bill_payload.insert(
        "contract_id".to_string(),
        Value::String(contract_id.to_string()),
    );
    bill_payload.insert("bill_type".to_string(), Value::String("utility".to_string()));
    bill_payload.insert("amount".to_string(), money::to_json_number(total));
    bill_payload.insert(
        "received_amount".to_string(),
        money::to_json_number(Decimal::ZERO),
    );
    bill_payload.insert("pending_amount".to_string(), money::to_json_number(total));
    bill_payload.insert(
        "due_date".to_string(),
        Value::String(Utc::now().date_naive().to_string()),
    );
    bill_payload.insert("status".to_string(), Value::String("pending".to_string()));
    bill_payload.insert(
        "remarks".to_string(),
        Value::String(format!("Utility charges ({} readings)", readings.len())),
    );

    let bill = create_row(pool, "bills", &bill_payload).await?;
    let bill_id = val_str(&bill, "id");

    let mut outcome = UtilityBillOutcome {
        bill: Some(bill),
        readings_billed: 0,
        errors: Vec::new(),
    };

    for reading in &readings {
        let reading_id = val_str(reading, "id");

        let mut detail = Map::new();
        detail.insert("bill_id".to_string(), Value::String(bill_id.clone()));
        detail.insert(
            "meter_reading_id".to_string(),
            Value::String(reading_id.clone()),
        );
        detail.insert(
            "meter_type".to_string(),
            Value::String(
                meter_type_by_id
                    .get(&val_str(reading, "meter_id"))
                    .cloned()
                    .unwrap_or_default(),
            ),
        );
        detail.insert(
            "usage_amount".to_string(),
            money::to_json_number(money::decimal_field(reading, "usage_amount")),
        );
        detail.insert(
            "unit_price".to_string(),
            money::to_json_number(money::decimal_field(reading, "unit_price")),
        );
        detail.insert(
            "amount".to_string(),
            money::to_json_number(money::decimal_field(reading, "amount")),
        );
        if let Err(error) = create_row(pool, "bill_details", &detail).await {
            warn!(%reading_id, error = %error, "Failed to write bill detail");
            outcome
                .errors
                .push(format!("Reading {reading_id}: {error}"));
            continue;
        }

        let mut patch = Map::new();
        patch.insert("is_billed".to_string(), Value::Bool(true));
        patch.insert("status".to_string(), Value::String("billed".to_string()));
        match update_row(pool, "meter_readings", &reading_id, &patch, "id").await {
            Ok(_) => outcome.readings_billed += 1,
            Err(error) => {
                // The detail row exists but the flag did not catch up, which
                // is the inconsistent state the repair pass fixes.
                warn!(%reading_id, error = %error, "Failed to flag reading billed");
                outcome
                    .errors
                    .push(format!("Reading {reading_id}: {error}"));
            }
        }
    }

    info!(
        contract_id,
        readings_billed = outcome.readings_billed,
        errors = outcome.errors.len(),
        "Utility bill generated"
    );

    Ok(outcome)
}

pub fn format_bill_number(contract_number: &str, bill_type: &str, sequence: u32) -> String {
    let code = match bill_type {
        "rent" => "RENT",
        "deposit" => "DEP",
        "key_deposit" => "KEY",
        "cleaning" => "CLN",
        "utility" => "UTL",
        _ => "OTH",
    };
    format!("{contract_number}-{code}-{sequence:02}")
}

fn payment_timing_months(timing: &str) -> u32 {
    match timing.trim().to_ascii_lowercase().as_str() {
        "quarterly" => 3,
        "semiannually" => 6,
        "annually" => 12,
        _ => 1,
    }
}

fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    let zero_based = date.month0() + months;
    let year = date.year() + (zero_based / 12) as i32;
    let month = zero_based % 12 + 1;
    NaiveDate::from_ymd_opt(year, month, date.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 28))
        .unwrap_or(date)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
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
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn dec(text: &str) -> Decimal {
        text.parse().expect("valid decimal literal")
    }

    fn date(text: &str) -> NaiveDate {
        text.parse().expect("valid date literal")
    }

    fn contract(overrides: Value) -> Value {
        let mut base = json!({
            "id": "c-1",
            "contract_number": "HT2024001",
            "status": "pending",
            "start_date": "2024-01-01",
            "end_date": "2024-01-31",
            "monthly_rent": 3000.0,
            "deposit": 6000.0,
            "key_deposit": 500.0,
            "cleaning_fee": 200.0,
            "payment_timing": "monthly"
        });
        if let (Some(base_obj), Some(override_obj)) = (base.as_object_mut(), overrides.as_object())
        {
            for (key, value) in override_obj {
                base_obj.insert(key.clone(), value.clone());
            }
        }
        base
    }

    #[test]
    fn one_period_contract_plans_exactly_four_bills() {
        let plan =
            plan_contract_bills(&contract(json!({})), ProrationPolicy::FullPeriod).expect("plan");

        assert_eq!(plan.len(), 4);
        let by_type = plan
            .iter()
            .map(|bill| (bill.bill_type.as_str(), bill.amount))
            .collect::<Vec<_>>();
        assert!(by_type.contains(&("rent", dec("3000"))));
        assert!(by_type.contains(&("deposit", dec("6000"))));
        assert!(by_type.contains(&("key_deposit", dec("500"))));
        assert!(by_type.contains(&("cleaning", dec("200"))));
        assert!(plan.iter().all(|bill| bill.due_date == date("2024-01-01")));
    }

    #[test]
    fn yearly_contract_plans_one_rent_bill_per_month() {
        let plan = plan_contract_bills(
            &contract(json!({"end_date": "2024-12-31"})),
            ProrationPolicy::FullPeriod,
        )
        .expect("plan");

        let rent = plan
            .iter()
            .filter(|bill| bill.bill_type == "rent")
            .collect::<Vec<_>>();
        assert_eq!(rent.len(), 12);
        assert_eq!(rent[0].due_date, date("2024-01-01"));
        assert_eq!(rent[11].due_date, date("2024-12-01"));
        assert!(rent.iter().all(|bill| bill.amount == dec("3000")));
    }

    #[test]
    fn quarterly_timing_bills_three_months_at_once() {
        let plan = plan_contract_bills(
            &contract(json!({"end_date": "2024-12-31", "payment_timing": "quarterly"})),
            ProrationPolicy::FullPeriod,
        )
        .expect("plan");

        let rent = plan
            .iter()
            .filter(|bill| bill.bill_type == "rent")
            .collect::<Vec<_>>();
        assert_eq!(rent.len(), 4);
        assert!(rent.iter().all(|bill| bill.amount == dec("9000")));
        assert_eq!(rent[1].due_date, date("2024-04-01"));
    }

    #[test]
    fn skips_optional_fee_bills_when_absent_or_zero() {
        let plan = plan_contract_bills(
            &contract(json!({"key_deposit": null, "cleaning_fee": 0.0})),
            ProrationPolicy::FullPeriod,
        )
        .expect("plan");

        assert!(plan.iter().all(|bill| bill.bill_type != "key_deposit"));
        assert!(plan.iter().all(|bill| bill.bill_type != "cleaning"));
        assert_eq!(plan.len(), 2); // rent + deposit
    }

    #[test]
    fn trailing_partial_period_follows_policy() {
        // Jan is whole; Feb 1–15 is 15 of 29 days (2024 is a leap year).
        let full = plan_contract_bills(
            &contract(json!({"end_date": "2024-02-15"})),
            ProrationPolicy::FullPeriod,
        )
        .expect("plan");
        let full_rent = full
            .iter()
            .filter(|bill| bill.bill_type == "rent")
            .collect::<Vec<_>>();
        assert_eq!(full_rent.len(), 2);
        assert_eq!(full_rent[1].amount, dec("3000"));

        let daily = plan_contract_bills(
            &contract(json!({"end_date": "2024-02-15"})),
            ProrationPolicy::Daily,
        )
        .expect("plan");
        let daily_rent = daily
            .iter()
            .filter(|bill| bill.bill_type == "rent")
            .collect::<Vec<_>>();
        assert_eq!(daily_rent[1].amount, dec("1551.72"));
    }

    #[test]
    fn replanning_against_existing_keys_is_idempotent() {
        let plan = plan_contract_bills(
            &contract(json!({"end_date": "2024-06-30"})),
            ProrationPolicy::FullPeriod,
        )
        .expect("plan");

        let existing = plan
            .iter()
            .map(|bill| (bill.bill_type.clone(), bill.due_date.to_string()))
            .collect::<HashSet<_>>();

        let second = plan_contract_bills(
            &contract(json!({"end_date": "2024-06-30"})),
            ProrationPolicy::FullPeriod,
        )
        .expect("plan");
        let fresh = second
            .iter()
            .filter(|bill| {
                !existing.contains(&(bill.bill_type.clone(), bill.due_date.to_string()))
            })
            .count();
        assert_eq!(fresh, 0);
    }

    #[test]
    fn rejects_inverted_date_ranges() {
        let result = plan_contract_bills(
            &contract(json!({"end_date": "2023-12-01"})),
            ProrationPolicy::FullPeriod,
        );
        assert!(result.is_err());
    }

    #[test]
    fn formats_bill_numbers() {
        assert_eq!(format_bill_number("HT2024001", "rent", 3), "HT2024001-RENT-03");
        assert_eq!(format_bill_number("HT2024001", "deposit", 1), "HT2024001-DEP-01");
        assert_eq!(format_bill_number("HT2024001", "unknown", 12), "HT2024001-OTH-12");
    }

    #[test]
    fn month_arithmetic_clamps_short_months() {
        assert_eq!(add_months(date("2024-01-31"), 1), date("2024-02-28"));
        assert_eq!(add_months(date("2024-11-15"), 2), date("2025-01-15"));
        assert_eq!(add_months(date("2024-12-01"), 1), date("2025-01-01"));
    }

    #[test]
    fn timing_month_mapping() {
        assert_eq!(payment_timing_months("monthly"), 1);
        assert_eq!(payment_timing_months("quarterly"), 3);
        assert_eq!(payment_timing_months("semiannually"), 6);
        assert_eq!(payment_timing_months("annually"), 12);
        assert_eq!(payment_timing_months("fortnightly"), 1);
    }
}
