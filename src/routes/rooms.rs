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
        CreateRoomInput, RoomPath, RoomsQuery, UpdateRoomInput,
    },
    state::AppState,
};

pub const ROOM_STATUSES: &[&str] = &["vacant", "occupied", "overdue", "maintenance"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/rooms", axum::routing::get(list_rooms).post(create_room))
        .route(
            "/rooms/{room_id}",
            axum::routing::get(get_room)
                .patch(update_room)
                .delete(delete_room),
        )
}

async fn list_rooms(
    State(state): State<AppState>,
    Query(query): Query<RoomsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(building_id) = non_empty_opt(query.building_id.as_deref()) {
        filters.insert("building_id".to_string(), Value::String(building_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let mut rows = list_rows(
        pool,
        "rooms",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "room_number",
        true,
    )
    .await?;
    money::normalize_money_rows(&mut rows, money::ROOM_MONEY_FIELDS);
    Ok(Json(json!({ "data": rows })))
}

async fn create_room(
    State(state): State<AppState>,
    Json(payload): Json<CreateRoomInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    ensure_one_of(&payload.status, ROOM_STATUSES, "room status")?;
    let pool = db_pool(&state)?;

    // Fails with 404 when the building reference is dangling.
    get_row(pool, "buildings", &payload.building_id, "id").await?;

    let record = remove_nulls(serialize_to_map(&payload));
    let mut created = create_row(pool, "rooms", &record).await?;
    money::normalize_money(&mut created, money::ROOM_MONEY_FIELDS);
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_room(
    State(state): State<AppState>,
    Path(path): Path<RoomPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let mut room = get_row(pool, "rooms", &path.room_id, "id").await?;
    money::normalize_money(&mut room, money::ROOM_MONEY_FIELDS);
    Ok(Json(room))
}

async fn update_room(
    State(state): State<AppState>,
    Path(path): Path<RoomPath>,
    Json(payload): Json<UpdateRoomInput>,
) -> AppResult<Json<Value>> {
    if let Some(status) = payload.status.as_deref() {
        ensure_one_of(status, ROOM_STATUSES, "room status")?;
    }
    let pool = db_pool(&state)?;

    let patch = remove_nulls(serialize_to_map(&payload));
    let mut updated = update_row(pool, "rooms", &path.room_id, &patch, "id").await?;
    money::normalize_money(&mut updated, money::ROOM_MONEY_FIELDS);
    Ok(Json(updated))
}

async fn delete_room(
    State(state): State<AppState>,
    Path(path): Path<RoomPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("room_id".to_string(), Value::String(path.room_id.clone()));
    filters.insert("status".to_string(), Value::String("active".to_string()));
    let active = list_rows(pool, "contracts", Some(&filters), 1, 0, "created_at", true).await?;
    if !active.is_empty() {
        return Err(AppError::Conflict(
            "Room has an active contract and cannot be deleted.".to_string(),
        ));
    }

    let mut deleted = delete_row(pool, "rooms", &path.room_id, "id").await?;
    money::normalize_money(&mut deleted, money::ROOM_MONEY_FIELDS);
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
