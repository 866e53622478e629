use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use crate::money;
use crate::repository::table_service::{count_rows, list_rows};
use crate::services::reading_consistency;
use crate::state::AppState;

/// Overall service health: is the process up and can it reach the database.
pub async fn system_health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (status, db_ok) = match &state.db_pool {
        Some(pool) => {
            // Short timeout so the healthcheck always responds quickly, even
            // if the first DB connection hangs (DNS, SSL, TCP).
            match tokio::time::timeout(
                Duration::from_secs(3),
                sqlx::query("SELECT 1").fetch_one(pool),
            )
            .await
            {
                Ok(Ok(_)) => ("healthy", true),
                Ok(Err(error)) => {
                    tracing::error!(error = %error, "Health check DB query failed");
                    ("unhealthy", false)
                }
                Err(_) => {
                    tracing::error!("Health check DB query timed out (3s)");
                    ("unhealthy", false)
                }
            }
        }
        None => ("degraded", false),
    };

    let http_status = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "status": status,
            "now": Utc::now().to_rfc3339(),
            "db": db_ok,
        })),
    )
}

/// Billing subsystem health: the pending-amount invariant, reading/bill
/// consistency, and the overdue backlog.
pub async fn bills_health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let Some(pool) = &state.db_pool else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "reason": "database not configured" })),
        );
    };

    let bills = match list_rows(pool, "bills", None, 5000, 0, "due_date", true).await {
        Ok(rows) => rows,
        Err(error) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "reason": error.to_string() })),
            );
        }
    };

    let mut invariant_breaches = 0i64;
    for bill in &bills {
        let amount = money::decimal_field(bill, "amount");
        let received = money::decimal_field(bill, "received_amount");
        let pending = money::decimal_field(bill, "pending_amount");
        if pending < Decimal::ZERO || pending != amount - received {
            invariant_breaches += 1;
        }
    }

    let mut overdue_filter = Map::new();
    overdue_filter.insert("status".to_string(), Value::String("overdue".to_string()));
    let overdue_backlog = count_rows(pool, "bills", Some(&overdue_filter))
        .await
        .unwrap_or(0);

    let inconsistencies =
        match reading_consistency::validate_reading_bill_consistency(pool).await {
            Ok(report) => report.total_inconsistencies as i64,
            Err(error) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "status": "unhealthy", "reason": error.to_string() })),
                );
            }
        };

    let status = if invariant_breaches > 0 {
        "unhealthy"
    } else if inconsistencies > 0 || overdue_backlog > 0 {
        "degraded"
    } else {
        "healthy"
    };

    let http_status = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "status": status,
            "now": Utc::now().to_rfc3339(),
            "bills_checked": bills.len(),
            "invariant_breaches": invariant_breaches,
            "reading_inconsistencies": inconsistencies,
            "overdue_backlog": overdue_backlog,
        })),
    )
}
