use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    money,
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, ensure_one_of, remove_nulls, serialize_to_map, validate_input,
        ActivateContractsInput, ContractPath, ContractsQuery, CreateContractInput,
        UpdateContractInput,
    },
    services::{
        bill_generation::{self, ProrationPolicy},
        contract_activation, settings,
    },
    state::AppState,
};

pub const CONTRACT_STATUSES: &[&str] = &["pending", "active", "expired", "terminated"];
pub const PAYMENT_TIMINGS: &[&str] = &["monthly", "quarterly", "semiannually", "annually"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/contracts",
            axum::routing::get(list_contracts).post(create_contract),
        )
        .route("/contracts/activate", axum::routing::post(activate_contracts))
        .route(
            "/contracts/{contract_id}",
            axum::routing::get(get_contract)
                .patch(update_contract)
                .delete(delete_contract),
        )
        .route(
            "/contracts/{contract_id}/generate-bills",
            axum::routing::post(generate_bills),
        )
        .route(
            "/contracts/{contract_id}/generate-utility-bill",
            axum::routing::post(generate_utility_bill),
        )
        .route(
            "/contracts/{contract_id}/checkout",
            axum::routing::post(checkout_contract),
        )
}

async fn list_contracts(
    State(state): State<AppState>,
    Query(query): Query<ContractsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        ensure_one_of(&status, CONTRACT_STATUSES, "status")?;
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(room_id) = non_empty_opt(query.room_id.as_deref()) {
        filters.insert("room_id".to_string(), Value::String(room_id));
    }
    if let Some(renter_id) = non_empty_opt(query.renter_id.as_deref()) {
        filters.insert("renter_id".to_string(), Value::String(renter_id));
    }

    let mut rows = list_rows(
        pool,
        "contracts",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "start_date",
        false,
    )
    .await?;
    money::normalize_money_rows(&mut rows, money::CONTRACT_MONEY_FIELDS);
    Ok(Json(json!({ "data": rows })))
}

async fn create_contract(
    State(state): State<AppState>,
    Json(payload): Json<CreateContractInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    ensure_one_of(&payload.payment_timing, PAYMENT_TIMINGS, "payment_timing")?;
    if payload.status != "pending" {
        return Err(AppError::UnprocessableEntity(
            "New contracts must start in pending state; use the activation endpoint.".to_string(),
        ));
    }
    let pool = db_pool(&state)?;

    let start = parse_date(&payload.start_date)
        .ok_or_else(|| AppError::BadRequest("start_date must be YYYY-MM-DD.".to_string()))?;
    let end = parse_date(&payload.end_date)
        .ok_or_else(|| AppError::BadRequest("end_date must be YYYY-MM-DD.".to_string()))?;
    if end < start {
        return Err(AppError::BadRequest(
            "end_date must be on or after start_date.".to_string(),
        ));
    }

    get_row(pool, "renters", &payload.renter_id, "id").await?;
    get_row(pool, "rooms", &payload.room_id, "id").await?;

    let mut record = remove_nulls(serialize_to_map(&payload));

    // total_rent defaults to the sum of the rent bills the term implies.
    if !record.contains_key("total_rent") {
        let policy_raw =
            settings::get_string(pool, settings::PRORATION_POLICY_KEY, "full_period").await;
        let plan = bill_generation::plan_contract_bills(
            &Value::Object(record.clone()),
            ProrationPolicy::from_setting(&policy_raw),
        )?;
        let total_rent = plan
            .iter()
            .filter(|bill| bill.bill_type == "rent")
            .map(|bill| bill.amount)
            .sum::<Decimal>();
        record.insert("total_rent".to_string(), money::to_json_number(total_rent));
    }

    let mut created = create_row(pool, "contracts", &record).await?;
    money::normalize_money(&mut created, money::CONTRACT_MONEY_FIELDS);
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut contract = get_row(pool, "contracts", &path.contract_id, "id").await?;

    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(path.contract_id.clone()),
    );
    let mut bills = list_rows(pool, "bills", Some(&filters), 500, 0, "due_date", true).await?;
    money::normalize_money_rows(&mut bills, money::BILL_MONEY_FIELDS);

    money::normalize_money(&mut contract, money::CONTRACT_MONEY_FIELDS);
    if let Some(obj) = contract.as_object_mut() {
        obj.insert("bills".to_string(), Value::Array(bills));
    }
    Ok(Json(contract))
}

async fn update_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    Json(payload): Json<UpdateContractInput>,
) -> AppResult<Json<Value>> {
    if let Some(timing) = payload.payment_timing.as_deref() {
        ensure_one_of(timing, PAYMENT_TIMINGS, "payment_timing")?;
    }
    let pool = db_pool(&state)?;

    let record = get_row(pool, "contracts", &path.contract_id, "id").await?;
    let patch = remove_nulls(serialize_to_map(&payload));

    if let Some(end_raw) = patch.get("end_date").and_then(Value::as_str) {
        let start = parse_date(&val_str(&record, "start_date"))
            .ok_or_else(|| AppError::Internal("Contract has an invalid start_date.".to_string()))?;
        let end = parse_date(end_raw)
            .ok_or_else(|| AppError::BadRequest("end_date must be YYYY-MM-DD.".to_string()))?;
        if end < start {
            return Err(AppError::BadRequest(
                "end_date must be on or after start_date.".to_string(),
            ));
        }
    }

    let mut updated = update_row(pool, "contracts", &path.contract_id, &patch, "id").await?;
    money::normalize_money(&mut updated, money::CONTRACT_MONEY_FIELDS);
    Ok(Json(updated))
}

async fn delete_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let record = get_row(pool, "contracts", &path.contract_id, "id").await?;
    if val_str(&record, "status") == "active" {
        return Err(AppError::Conflict(
            "Active contracts cannot be deleted; check out the contract first.".to_string(),
        ));
    }

    let mut deleted = delete_row(pool, "contracts", &path.contract_id, "id").await?;
    money::normalize_money(&mut deleted, money::CONTRACT_MONEY_FIELDS);
    Ok(Json(json!({ "deleted": deleted })))
}

/// Batch-activate due pending contracts, or activate one on demand when a
/// contract id is supplied.
async fn activate_contracts(
    State(state): State<AppState>,
    payload: Option<Json<ActivateContractsInput>>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let input = payload.map(|Json(input)| input).unwrap_or_default();

    match non_empty_opt(input.contract_id.as_deref()) {
        Some(contract_id) => {
            let activation = contract_activation::activate_contract(pool, &contract_id).await?;
            let bills_created = activation
                .generation
                .as_ref()
                .map(|generation| generation.created.len())
                .unwrap_or(0);
            let mut body = json!({
                "message": "Contract activated.",
                "contract_id": contract_id,
                "bills_created": bills_created,
            });
            if let (Some(obj), Some(error)) =
                (body.as_object_mut(), activation.generation_error)
            {
                obj.insert("generation_error".to_string(), Value::String(error));
            }
            Ok(Json(body))
        }
        None => {
            let outcome = contract_activation::activate_pending_contracts(pool).await?;
            Ok(Json(json!({
                "activated": outcome.activated,
                "expired": outcome.expired,
                "bills_created": outcome.bills_created,
                "errors": outcome.errors,
            })))
        }
    }
}

/// (Re)generate the bill set for a contract. Idempotent.
async fn generate_bills(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let outcome = bill_generation::generate_bills_for_contract(pool, &path.contract_id).await?;
    let mut created = outcome.created;
    money::normalize_money_rows(&mut created, money::BILL_MONEY_FIELDS);

    Ok(Json(json!({
        "created": created,
        "skipped": outcome.skipped,
        "failed": outcome.failed,
    })))
}

/// Roll confirmed, unbilled meter readings into a utility bill.
async fn generate_utility_bill(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut outcome = bill_generation::generate_utility_bill(pool, &path.contract_id).await?;
    if let Some(bill) = outcome.bill.as_mut() {
        money::normalize_money(bill, money::BILL_MONEY_FIELDS);
    }

    Ok(Json(json!({
        "bill": outcome.bill,
        "readings_billed": outcome.readings_billed,
        "errors": outcome.errors,
    })))
}

/// Terminate an active contract and release its room.
async fn checkout_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let record = get_row(pool, "contracts", &path.contract_id, "id").await?;
    let status = val_str(&record, "status");
    if status != "active" {
        return Err(AppError::Conflict(format!(
            "Contract is {status}; only active contracts can be checked out."
        )));
    }

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("terminated".to_string()));
    patch.insert(
        "terminated_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    let mut updated = update_row(pool, "contracts", &path.contract_id, &patch, "id").await?;

    let room_id = val_str(&record, "room_id");
    if !room_id.is_empty() {
        let mut room_patch = Map::new();
        room_patch.insert("status".to_string(), Value::String("vacant".to_string()));
        if let Err(error) = update_row(pool, "rooms", &room_id, &room_patch, "id").await {
            tracing::warn!(%room_id, error = %error, "Failed to mark room vacant on checkout");
        }
    }

    money::normalize_money(&mut updated, money::CONTRACT_MONEY_FIELDS);
    Ok(Json(json!({
        "message": "Contract terminated.",
        "contract": updated,
    })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
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
