use axum::{extract::State, Json};
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{count_rows, list_rows},
    routes::rooms::ROOM_STATUSES,
    services::bill_stats::{self, GroupBy},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/dashboard/summary", axum::routing::get(dashboard_summary))
}

/// One-call overview for the landing page: occupancy, current-month billing,
/// pending readings, and contracts about to expire.
async fn dashboard_summary(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let today = Utc::now().date_naive();

    let mut rooms_by_status = Map::new();
    for status in ROOM_STATUSES {
        let mut filters = Map::new();
        filters.insert("status".to_string(), Value::String((*status).to_string()));
        let count = count_rows(pool, "rooms", Some(&filters)).await?;
        rooms_by_status.insert((*status).to_string(), Value::from(count));
    }

    let mut active_filter = Map::new();
    active_filter.insert("status".to_string(), Value::String("active".to_string()));
    let active_contracts = count_rows(pool, "contracts", Some(&active_filter)).await?;

    let mut pending_filter = Map::new();
    pending_filter.insert("status".to_string(), Value::String("pending".to_string()));
    let pending_contracts = count_rows(pool, "contracts", Some(&pending_filter)).await?;

    let horizon = today + Duration::days(30);
    let mut expiring_filter = Map::new();
    expiring_filter.insert("status".to_string(), Value::String("active".to_string()));
    expiring_filter.insert(
        "end_date__gte".to_string(),
        Value::String(today.to_string()),
    );
    expiring_filter.insert(
        "end_date__lte".to_string(),
        Value::String(horizon.to_string()),
    );
    let expiring_contracts = list_rows(
        pool,
        "contracts",
        Some(&expiring_filter),
        200,
        0,
        "end_date",
        true,
    )
    .await?
    .len();

    let mut pending_readings_filter = Map::new();
    pending_readings_filter.insert("status".to_string(), Value::String("pending".to_string()));
    let pending_readings = count_rows(pool, "meter_readings", Some(&pending_readings_filter)).await?;

    let (month_start, month_end) =
        bill_stats::parse_date_range(None, None, Some("month"), today)?;
    let month_bills =
        bill_stats::detailed_stats(pool, month_start, month_end, GroupBy::Day, false).await?;
    let month_summary = json!({
        "start": month_bills["start"],
        "end": month_bills["end"],
        "total_amount": month_bills["total_amount"],
        "paid_amount": month_bills["paid_amount"],
        "pending_amount": month_bills["pending_amount"],
        "overdue_amount": month_bills["overdue_amount"],
        "bill_count": month_bills["bill_count"],
    });

    Ok(Json(json!({
        "date": today.to_string(),
        "rooms_by_status": rooms_by_status,
        "contracts": {
            "active": active_contracts,
            "pending": pending_contracts,
            "expiring_within_30_days": expiring_contracts,
        },
        "pending_readings": pending_readings,
        "bills_this_month": month_summary,
    })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
