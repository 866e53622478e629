use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    money,
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, ensure_one_of, remove_nulls, serialize_to_map, validate_input,
        BillPath, BillPaymentInput, BillStatsQuery, BillsQuery, CreateBillInput, UpdateBillInput,
    },
    services::{bill_generation, bill_stats},
    state::AppState,
};

pub const BILL_STATUSES: &[&str] = &["pending", "paid", "overdue", "completed"];
pub const BILL_TYPES: &[&str] = &[
    "rent",
    "deposit",
    "key_deposit",
    "cleaning",
    "utility",
    "other",
];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/bills", axum::routing::get(list_bills).post(create_bill))
        .route("/bills/stats", axum::routing::get(get_bill_stats))
        .route(
            "/bills/refresh-overdue",
            axum::routing::post(refresh_overdue),
        )
        .route(
            "/bills/{bill_id}",
            axum::routing::get(get_bill)
                .patch(update_bill)
                .delete(delete_bill),
        )
        .route("/bills/{bill_id}/payments", axum::routing::post(pay_bill))
}

async fn list_bills(
    State(state): State<AppState>,
    Query(query): Query<BillsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(contract_id) = non_empty_opt(query.contract_id.as_deref()) {
        filters.insert("contract_id".to_string(), Value::String(contract_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(bill_type) = non_empty_opt(query.bill_type.as_deref()) {
        filters.insert("bill_type".to_string(), Value::String(bill_type));
    }
    if let Some(due_from) = non_empty_opt(query.due_from.as_deref()) {
        filters.insert("due_date__gte".to_string(), Value::String(due_from));
    }
    if let Some(due_to) = non_empty_opt(query.due_to.as_deref()) {
        filters.insert("due_date__lte".to_string(), Value::String(due_to));
    }

    let mut rows = list_rows(
        pool,
        "bills",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 2000),
        0,
        "due_date",
        false,
    )
    .await?;
    money::normalize_money_rows(&mut rows, money::BILL_MONEY_FIELDS);
    Ok(Json(json!({ "data": rows })))
}

async fn create_bill(
    State(state): State<AppState>,
    Json(payload): Json<CreateBillInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    ensure_one_of(&payload.bill_type, BILL_TYPES, "bill_type")?;
    ensure_one_of(&payload.status, &["pending"], "bill status")?;
    if payload.amount < 0.0 {
        return Err(AppError::UnprocessableEntity(
            "amount must be non-negative.".to_string(),
        ));
    }
    let pool = db_pool(&state)?;

    let contract = get_row(pool, "contracts", &payload.contract_id, "id").await?;

    let mut type_filter = Map::new();
    type_filter.insert(
        "contract_id".to_string(),
        Value::String(payload.contract_id.clone()),
    );
    type_filter.insert(
        "bill_type".to_string(),
        Value::String(payload.bill_type.clone()),
    );
    let existing = list_rows(pool, "bills", Some(&type_filter), 1000, 0, "due_date", true).await?;

    let bill_number = bill_generation::format_bill_number(
        &val_str(&contract, "contract_number"),
        &payload.bill_type,
        existing.len() as u32 + 1,
    );

    let amount = Decimal::try_from(payload.amount)
        .map_err(|_| AppError::UnprocessableEntity("amount is not a valid number.".to_string()))?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("bill_number".to_string(), Value::String(bill_number));
    record.insert("amount".to_string(), money::to_json_number(amount));
    record.insert(
        "received_amount".to_string(),
        money::to_json_number(Decimal::ZERO),
    );
    record.insert("pending_amount".to_string(), money::to_json_number(amount));

    let mut created = create_row(pool, "bills", &record).await?;
    money::normalize_money(&mut created, money::BILL_MONEY_FIELDS);
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut bill = get_row(pool, "bills", &path.bill_id, "id").await?;

    let mut filters = Map::new();
    filters.insert("bill_id".to_string(), Value::String(path.bill_id.clone()));
    let mut details = list_rows(
        pool,
        "bill_details",
        Some(&filters),
        200,
        0,
        "created_at",
        true,
    )
    .await?;
    money::normalize_money_rows(&mut details, money::BILL_DETAIL_MONEY_FIELDS);

    money::normalize_money(&mut bill, money::BILL_MONEY_FIELDS);
    if let Some(obj) = bill.as_object_mut() {
        obj.insert("details".to_string(), Value::Array(details));
    }
    Ok(Json(bill))
}

async fn update_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    Json(payload): Json<UpdateBillInput>,
) -> AppResult<Json<Value>> {
    if let Some(status) = payload.status.as_deref() {
        ensure_one_of(status, BILL_STATUSES, "bill status")?;
    }
    let pool = db_pool(&state)?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let mut updated = update_row(pool, "bills", &path.bill_id, &patch, "id").await?;
    money::normalize_money(&mut updated, money::BILL_MONEY_FIELDS);
    Ok(Json(updated))
}

async fn delete_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let record = get_row(pool, "bills", &path.bill_id, "id").await?;
    let status = val_str(&record, "status");
    let received = money::decimal_field(&record, "received_amount");
    if delete_is_protected(&status, received) {
        return Err(AppError::Conflict(
            "Settled bills cannot be deleted.".to_string(),
        ));
    }

    let mut deleted = delete_row(pool, "bills", &path.bill_id, "id").await?;
    money::normalize_money(&mut deleted, money::BILL_MONEY_FIELDS);
    Ok(Json(json!({ "deleted": deleted })))
}

/// Apply a payment to a bill, keeping `pending_amount = amount −
/// received_amount` non-negative. Overpayment is rejected rather than
/// credited.
async fn pay_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    Json(payload): Json<BillPaymentInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let record = get_row(pool, "bills", &path.bill_id, "id").await?;
    let payment = Decimal::try_from(payload.amount)
        .map_err(|_| AppError::UnprocessableEntity("amount is not a valid number.".to_string()))?;

    let applied = apply_payment(
        money::decimal_field(&record, "amount"),
        money::decimal_field(&record, "received_amount"),
        &val_str(&record, "status"),
        payment,
    )?;

    let mut patch = Map::new();
    patch.insert(
        "received_amount".to_string(),
        money::to_json_number(applied.received),
    );
    patch.insert(
        "pending_amount".to_string(),
        money::to_json_number(applied.pending),
    );
    patch.insert("status".to_string(), Value::String(applied.status.clone()));
    if applied.status == "paid" {
        patch.insert("paid_at".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    if let Some(reference) = non_empty_opt(payload.reference.as_deref()) {
        let existing_remarks = val_str(&record, "remarks");
        let remarks = if existing_remarks.is_empty() {
            format!("payment ref {reference}")
        } else {
            format!("{existing_remarks} (payment ref {reference})")
        };
        patch.insert("remarks".to_string(), Value::String(remarks));
    }

    let mut updated = update_row(pool, "bills", &path.bill_id, &patch, "id").await?;
    money::normalize_money(&mut updated, money::BILL_MONEY_FIELDS);

    tracing::info!(
        bill_id = %path.bill_id,
        payment = %payment,
        method = payload.payment_method.as_deref().unwrap_or("unspecified"),
        new_status = %applied.status,
        "Payment applied"
    );

    Ok(Json(updated))
}

async fn get_bill_stats(
    State(state): State<AppState>,
    Query(query): Query<BillStatsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let stats = bill_stats::detailed_stats_now(
        pool,
        query.start.as_deref(),
        query.end.as_deref(),
        query.range.as_deref(),
        &query.group_by,
        query.comparison,
    )
    .await?;
    Ok(Json(stats))
}

async fn refresh_overdue(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let outcome = bill_generation::refresh_overdue_bills(pool).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

#[derive(Debug, PartialEq)]
struct PaymentApplication {
    received: Decimal,
    pending: Decimal,
    status: String,
}

fn apply_payment(
    amount: Decimal,
    received: Decimal,
    current_status: &str,
    payment: Decimal,
) -> Result<PaymentApplication, AppError> {
    if payment <= Decimal::ZERO {
        return Err(AppError::UnprocessableEntity(
            "Payment amount must be positive.".to_string(),
        ));
    }
    if current_status == "completed" {
        return Err(AppError::Conflict(
            "Completed bills do not accept payments.".to_string(),
        ));
    }

    let new_received = received + payment;
    if new_received > amount {
        return Err(AppError::Conflict(format!(
            "Payment exceeds the pending balance ({}).",
            (amount - received).round_dp(2)
        )));
    }

    let pending = amount - new_received;
    let status = if pending == Decimal::ZERO {
        "paid".to_string()
    } else {
        current_status.to_string()
    };

    Ok(PaymentApplication {
        received: new_received,
        pending,
        status,
    })
}

fn delete_is_protected(status: &str, received: Decimal) -> bool {
    (status == "paid" && received > Decimal::ZERO) || status == "completed"
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

fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{apply_payment, delete_is_protected};
    use crate::error::AppError;
    use rust_decimal::Decimal;

    fn dec(text: &str) -> Decimal {
        text.parse().expect("valid decimal literal")
    }

    #[test]
    fn partial_payment_keeps_invariant_and_status() {
        let applied = apply_payment(dec("3000"), dec("0"), "pending", dec("1000")).unwrap();
        assert_eq!(applied.received, dec("1000"));
        assert_eq!(applied.pending, dec("2000"));
        assert_eq!(applied.status, "pending");

        // A late bill that gets a partial payment stays overdue.
        let applied = apply_payment(dec("3000"), dec("1000"), "overdue", dec("500")).unwrap();
        assert_eq!(applied.pending, dec("1500"));
        assert_eq!(applied.status, "overdue");
    }

    #[test]
    fn full_payment_flips_to_paid() {
        let applied = apply_payment(dec("3000"), dec("1000"), "overdue", dec("2000")).unwrap();
        assert_eq!(applied.received, dec("3000"));
        assert_eq!(applied.pending, Decimal::ZERO);
        assert_eq!(applied.status, "paid");
    }

    #[test]
    fn overpayment_and_bad_amounts_are_rejected() {
        assert!(matches!(
            apply_payment(dec("3000"), dec("2500"), "pending", dec("1000")),
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            apply_payment(dec("3000"), dec("0"), "pending", dec("0")),
            Err(AppError::UnprocessableEntity(_))
        ));
        assert!(matches!(
            apply_payment(dec("3000"), dec("0"), "pending", dec("-5")),
            Err(AppError::UnprocessableEntity(_))
        ));
        assert!(matches!(
            apply_payment(dec("3000"), dec("3000"), "completed", dec("1")),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn delete_protection_matrix() {
        assert!(delete_is_protected("paid", dec("100")));
        assert!(delete_is_protected("completed", Decimal::ZERO));
        assert!(!delete_is_protected("pending", Decimal::ZERO));
        assert!(!delete_is_protected("overdue", Decimal::ZERO));
        // A paid bill with nothing actually received is not protected.
        assert!(!delete_is_protected("paid", Decimal::ZERO));
    }
}
