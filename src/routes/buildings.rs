use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, BuildingPath,
        BuildingsQuery, CreateBuildingInput, UpdateBuildingInput,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/buildings",
            axum::routing::get(list_buildings).post(create_building),
        )
        .route(
            "/buildings/{building_id}",
            axum::routing::get(get_building)
                .patch(update_building)
                .delete(delete_building),
        )
}

async fn list_buildings(
    State(state): State<AppState>,
    Query(query): Query<BuildingsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = list_rows(
        pool,
        "buildings",
        None,
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "name",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_building(
    State(state): State<AppState>,
    Json(payload): Json<CreateBuildingInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "buildings", &record).await?;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_building(
    State(state): State<AppState>,
    Path(path): Path<BuildingPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let building = get_row(pool, "buildings", &path.building_id, "id").await?;
    Ok(Json(building))
}

async fn update_building(
    State(state): State<AppState>,
    Path(path): Path<BuildingPath>,
    Json(payload): Json<UpdateBuildingInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "buildings", &path.building_id, &patch, "id").await?;
    Ok(Json(updated))
}

async fn delete_building(
    State(state): State<AppState>,
    Path(path): Path<BuildingPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "building_id".to_string(),
        Value::String(path.building_id.clone()),
    );
    let room_count = count_rows(pool, "rooms", Some(&filters)).await?;
    if room_count > 0 {
        return Err(AppError::Conflict(format!(
            "Building still has {room_count} room(s); delete or move them first."
        )));
    }

    let deleted = delete_row(pool, "buildings", &path.building_id, "id").await?;
    Ok(Json(json!({ "deleted": deleted })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
