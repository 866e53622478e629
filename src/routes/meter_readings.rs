use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    money,
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, ensure_one_of, remove_nulls, serialize_to_map, CreateReadingInput,
        ReadingPath, ReadingsQuery, UpdateReadingInput,
    },
    services::reading_consistency,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/meter-readings",
            axum::routing::get(list_readings).post(create_reading),
        )
        .route(
            "/meter-readings/status-check",
            axum::routing::get(status_check),
        )
        .route(
            "/meter-readings/repair-status",
            axum::routing::post(repair_status),
        )
        .route(
            "/meter-readings/status-stats",
            axum::routing::get(status_stats),
        )
        .route(
            "/meter-readings/{reading_id}",
            axum::routing::get(get_reading)
                .patch(update_reading)
                .delete(delete_reading),
        )
}

async fn list_readings(
    State(state): State<AppState>,
    Query(query): Query<ReadingsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(meter_id) = non_empty_opt(query.meter_id.as_deref()) {
        filters.insert("meter_id".to_string(), Value::String(meter_id));
    }
    if let Some(contract_id) = non_empty_opt(query.contract_id.as_deref()) {
        filters.insert("contract_id".to_string(), Value::String(contract_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(is_billed) = query.is_billed {
        filters.insert("is_billed".to_string(), Value::Bool(is_billed));
    }

    let mut rows = list_rows(
        pool,
        "meter_readings",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 2000),
        0,
        "reading_date",
        false,
    )
    .await?;
    money::normalize_money_rows(&mut rows, money::READING_MONEY_FIELDS);
    Ok(Json(json!({ "data": rows })))
}

async fn create_reading(
    State(state): State<AppState>,
    Json(payload): Json<CreateReadingInput>,
) -> AppResult<impl IntoResponse> {
    ensure_one_of(&payload.status, &["pending", "confirmed"], "reading status")?;
    let pool = db_pool(&state)?;

    let meter = get_row(pool, "meters", &payload.meter_id, "id").await?;
    if let Some(contract_id) = non_empty_opt(payload.contract_id.as_deref()) {
        get_row(pool, "contracts", &contract_id, "id").await?;
    }

    let current = Decimal::try_from(payload.current_reading).map_err(|_| {
        AppError::UnprocessableEntity("current_reading is not a valid number.".to_string())
    })?;
    let previous = match payload.previous_reading {
        Some(raw) => Some(Decimal::try_from(raw).map_err(|_| {
            AppError::UnprocessableEntity("previous_reading is not a valid number.".to_string())
        })?),
        None => None,
    };

    // Unit price falls back to the meter's configured price.
    let unit_price = match payload.unit_price {
        Some(raw) => Decimal::try_from(raw).map_err(|_| {
            AppError::UnprocessableEntity("unit_price is not a valid number.".to_string())
        })?,
        None => money::decimal_field(&meter, "unit_price"),
    };

    let (usage_amount, amount) = derive_reading_amounts(previous, current, unit_price)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("current_reading".to_string(), money::to_json_number(current));
    if let Some(previous) = previous {
        record.insert(
            "previous_reading".to_string(),
            money::to_json_number(previous),
        );
    }
    record.insert("unit_price".to_string(), money::to_json_number(unit_price));
    record.insert(
        "usage_amount".to_string(),
        money::to_json_number(usage_amount),
    );
    record.insert("amount".to_string(), money::to_json_number(amount));
    record.insert("is_billed".to_string(), Value::Bool(false));

    let mut created = create_row(pool, "meter_readings", &record).await?;
    money::normalize_money(&mut created, money::READING_MONEY_FIELDS);
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_reading(
    State(state): State<AppState>,
    Path(path): Path<ReadingPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let mut reading = get_row(pool, "meter_readings", &path.reading_id, "id").await?;
    money::normalize_money(&mut reading, money::READING_MONEY_FIELDS);
    Ok(Json(reading))
}

async fn update_reading(
    State(state): State<AppState>,
    Path(path): Path<ReadingPath>,
    Json(payload): Json<UpdateReadingInput>,
) -> AppResult<Json<Value>> {
    if let Some(status) = payload.status.as_deref() {
        // The billed flag is owned by billing and the repair pass; manual
        // updates move readings between the unbilled states only.
        ensure_one_of(
            status,
            &["pending", "confirmed", "cancelled"],
            "reading status",
        )?;
    }
    let pool = db_pool(&state)?;

    let record = get_row(pool, "meter_readings", &path.reading_id, "id").await?;
    if val_bool(&record, "is_billed") && payload.status.is_some() {
        return Err(AppError::Conflict(
            "Billed readings cannot change status; run the consistency repair instead."
                .to_string(),
        ));
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    let mut updated = update_row(pool, "meter_readings", &path.reading_id, &patch, "id").await?;
    money::normalize_money(&mut updated, money::READING_MONEY_FIELDS);
    Ok(Json(updated))
}

async fn delete_reading(
    State(state): State<AppState>,
    Path(path): Path<ReadingPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let record = get_row(pool, "meter_readings", &path.reading_id, "id").await?;
    if val_bool(&record, "is_billed") {
        return Err(AppError::Conflict(
            "Billed readings cannot be deleted.".to_string(),
        ));
    }

    let mut deleted = delete_row(pool, "meter_readings", &path.reading_id, "id").await?;
    money::normalize_money(&mut deleted, money::READING_MONEY_FIELDS);
    Ok(Json(json!({ "deleted": deleted })))
}

/// Read-only consistency report: counts plus the flagged readings with
/// meter/room/renter context.
async fn status_check(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let mut report = reading_consistency::validate_reading_bill_consistency(pool).await?;

    money::normalize_money_rows(&mut report.orphaned, money::READING_MONEY_FIELDS);
    money::normalize_money_rows(&mut report.inconsistent, money::READING_MONEY_FIELDS);
    money::normalize_money_rows(&mut report.dangling_contract, money::READING_MONEY_FIELDS);

    Ok(Json(json!({
        "checked": report.checked,
        "consistent_billed": report.consistent_billed,
        "consistent_unbilled": report.consistent_unbilled,
        "orphaned": report.orphaned,
        "inconsistent": report.inconsistent,
        "dangling_contract": report.dangling_contract,
        "total_inconsistencies": report.total_inconsistencies,
    })))
}

/// Pre-check → repair → post-check. A non-zero post-repair count means the
/// repair did not converge (or something mutated concurrently) and is
/// escalated in the logs.
async fn repair_status(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let before = reading_consistency::validate_reading_bill_consistency(pool).await?;
    let outcome = reading_consistency::repair_reading_inconsistencies(pool).await?;
    let after = reading_consistency::validate_reading_bill_consistency(pool).await?;

    let fully_repaired = after.total_inconsistencies == 0;
    tracing::info!(
        before = before.total_inconsistencies,
        after = after.total_inconsistencies,
        fully_repaired,
        "Consistency repair pass finished"
    );
    if !fully_repaired {
        tracing::error!(
            before = before.total_inconsistencies,
            after = after.total_inconsistencies,
            "Consistency repair did not converge"
        );
    }

    Ok(Json(json!({
        "before": before.total_inconsistencies,
        "after": after.total_inconsistencies,
        "orphaned_repaired": outcome.orphaned_repaired,
        "inconsistent_repaired": outcome.inconsistent_repaired,
        "errors": outcome.errors,
        "fully_repaired": fully_repaired,
    })))
}

async fn status_stats(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let stats = reading_consistency::reading_status_stats(pool).await?;
    Ok(Json(stats))
}

/// usage = current − previous (non-negative), amount = usage × unit price.
fn derive_reading_amounts(
    previous: Option<Decimal>,
    current: Decimal,
    unit_price: Decimal,
) -> Result<(Decimal, Decimal), AppError> {
    let baseline = previous.unwrap_or(Decimal::ZERO);
    if current < baseline {
        return Err(AppError::UnprocessableEntity(
            "current_reading must not be below previous_reading.".to_string(),
        ));
    }
    if unit_price < Decimal::ZERO {
        return Err(AppError::UnprocessableEntity(
            "unit_price must be non-negative.".to_string(),
        ));
    }
    let usage = current - baseline;
    Ok((usage, (usage * unit_price).round_dp(2)))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

fn val_bool(row: &Value, key: &str) -> bool {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::derive_reading_amounts;
    use crate::error::AppError;
    use rust_decimal::Decimal;

    fn dec(text: &str) -> Decimal {
        text.parse().expect("valid decimal literal")
    }

    #[test]
    fn derives_usage_and_amount() {
        let (usage, amount) =
            derive_reading_amounts(Some(dec("120.5")), dec("150.5"), dec("1.2")).unwrap();
        assert_eq!(usage, dec("30"));
        assert_eq!(amount, dec("36.00"));

        // First reading on a meter has no baseline.
        let (usage, amount) = derive_reading_amounts(None, dec("42"), dec("3.5")).unwrap();
        assert_eq!(usage, dec("42"));
        assert_eq!(amount, dec("147.00"));
    }

    #[test]
    fn rejects_regressing_readings() {
        assert!(matches!(
            derive_reading_amounts(Some(dec("100")), dec("90"), dec("1")),
            Err(AppError::UnprocessableEntity(_))
        ));
        assert!(matches!(
            derive_reading_amounts(None, dec("10"), dec("-1")),
            Err(AppError::UnprocessableEntity(_))
        ));
    }
}
