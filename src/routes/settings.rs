use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    schemas::BulkUpdateSettingsInput,
    services::settings,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/settings",
            axum::routing::get(list_settings)
                .post(bulk_update_settings)
                .delete(reset_settings),
        )
        .route("/settings/init", axum::routing::post(init_settings))
}

async fn list_settings(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = settings::get_all(pool).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn bulk_update_settings(
    State(state): State<AppState>,
    Json(payload): Json<BulkUpdateSettingsInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let written = settings::bulk_update(pool, &payload.settings, &payload.scope).await?;
    Ok(Json(json!({
        "message": "Settings updated.",
        "written": written,
    })))
}

async fn reset_settings(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let seeded = settings::reset_to_defaults(pool).await?;
    Ok(Json(json!({
        "message": "Settings reset to defaults.",
        "seeded": seeded,
    })))
}

/// Seed defaults without touching existing rows. Safe to call repeatedly.
async fn init_settings(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let inserted = settings::seed_defaults(pool).await?;
    Ok(Json(json!({
        "message": if inserted > 0 { "Defaults seeded." } else { "Already initialized." },
        "inserted": inserted,
    })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
