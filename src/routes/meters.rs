use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    money,
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, ensure_one_of, remove_nulls, serialize_to_map, validate_input,
        CreateMeterInput, MeterPath, MetersQuery, UpdateMeterInput,
    },
    state::AppState,
};

pub const METER_TYPES: &[&str] = &["electricity", "cold_water", "hot_water", "gas"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/meters", axum::routing::get(list_meters).post(create_meter))
        .route(
            "/meters/{meter_id}",
            axum::routing::get(get_meter)
                .patch(update_meter)
                .delete(delete_meter),
        )
}

async fn list_meters(
    State(state): State<AppState>,
    Query(query): Query<MetersQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(room_id) = non_empty_opt(query.room_id.as_deref()) {
        filters.insert("room_id".to_string(), Value::String(room_id));
    }
    if let Some(meter_type) = non_empty_opt(query.meter_type.as_deref()) {
        filters.insert("meter_type".to_string(), Value::String(meter_type));
    }
    if let Some(is_active) = query.is_active {
        filters.insert("is_active".to_string(), Value::Bool(is_active));
    }

    let mut rows = list_rows(
        pool,
        "meters",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "sort_order",
        true,
    )
    .await?;
    money::normalize_money_rows(&mut rows, money::METER_MONEY_FIELDS);
    Ok(Json(json!({ "data": rows })))
}

async fn create_meter(
    State(state): State<AppState>,
    Json(payload): Json<CreateMeterInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    ensure_one_of(&payload.meter_type, METER_TYPES, "meter_type")?;
    let pool = db_pool(&state)?;

    get_row(pool, "rooms", &payload.room_id, "id").await?;

    let record = remove_nulls(serialize_to_map(&payload));
    let mut created = create_row(pool, "meters", &record).await?;
    money::normalize_money(&mut created, money::METER_MONEY_FIELDS);
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_meter(
    State(state): State<AppState>,
    Path(path): Path<MeterPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let mut meter = get_row(pool, "meters", &path.meter_id, "id").await?;
    money::normalize_money(&mut meter, money::METER_MONEY_FIELDS);
    Ok(Json(meter))
}

async fn update_meter(
    State(state): State<AppState>,
    Path(path): Path<MeterPath>,
    Json(payload): Json<UpdateMeterInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let mut updated = update_row(pool, "meters", &path.meter_id, &patch, "id").await?;
    money::normalize_money(&mut updated, money::METER_MONEY_FIELDS);
    Ok(Json(updated))
}

async fn delete_meter(
    State(state): State<AppState>,
    Path(path): Path<MeterPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("meter_id".to_string(), Value::String(path.meter_id.clone()));
    let readings = list_rows(
        pool,
        "meter_readings",
        Some(&filters),
        1,
        0,
        "created_at",
        true,
    )
    .await?;
    if !readings.is_empty() {
        return Err(AppError::Conflict(
            "Meter has recorded readings and cannot be deleted; deactivate it instead.".to_string(),
        ));
    }

    let mut deleted = delete_row(pool, "meters", &path.meter_id, "id").await?;
    money::normalize_money(&mut deleted, money::METER_MONEY_FIELDS);
    Ok(Json(json!({ "deleted": deleted })))
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
