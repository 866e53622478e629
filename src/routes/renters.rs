use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateRenterInput,
        RenterPath, RentersQuery, UpdateRenterInput,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/renters",
            axum::routing::get(list_renters).post(create_renter),
        )
        .route(
            "/renters/{renter_id}",
            axum::routing::get(get_renter)
                .patch(update_renter)
                .delete(delete_renter),
        )
}

async fn list_renters(
    State(state): State<AppState>,
    Query(query): Query<RentersQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = list_rows(
        pool,
        "renters",
        None,
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "name",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_renter(
    State(state): State<AppState>,
    Json(payload): Json<CreateRenterInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "renters", &record).await?;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn get_renter(
    State(state): State<AppState>,
    Path(path): Path<RenterPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let renter = get_row(pool, "renters", &path.renter_id, "id").await?;

    // Contract history travels with the renter record.
    let mut filters = Map::new();
    filters.insert(
        "renter_id".to_string(),
        Value::String(path.renter_id.clone()),
    );
    let contracts = list_rows(
        pool,
        "contracts",
        Some(&filters),
        200,
        0,
        "start_date",
        false,
    )
    .await?;

    let mut item = renter;
    if let Some(obj) = item.as_object_mut() {
        obj.insert("contracts".to_string(), Value::Array(contracts));
    }
    Ok(Json(item))
}

async fn update_renter(
    State(state): State<AppState>,
    Path(path): Path<RenterPath>,
    Json(payload): Json<UpdateRenterInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let patch = remove_nulls(serialize_to_map(&payload));
    let updated = update_row(pool, "renters", &path.renter_id, &patch, "id").await?;
    Ok(Json(updated))
}

async fn delete_renter(
    State(state): State<AppState>,
    Path(path): Path<RenterPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "renter_id".to_string(),
        Value::String(path.renter_id.clone()),
    );
    filters.insert("status".to_string(), Value::String("active".to_string()));
    let active = list_rows(pool, "contracts", Some(&filters), 1, 0, "created_at", true).await?;
    if !active.is_empty() {
        return Err(AppError::Conflict(
            "Renter has an active contract and cannot be deleted.".to_string(),
        ));
    }

    let deleted = delete_row(pool, "renters", &path.renter_id, "id").await?;
    Ok(Json(json!({ "deleted": deleted })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
