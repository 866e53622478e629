use axum::{routing::get, Router};

use crate::state::AppState;

pub mod bills;
pub mod buildings;
pub mod contracts;
pub mod dashboard;
pub mod health;
pub mod meter_readings;
pub mod meters;
pub mod renters;
pub mod rooms;
pub mod settings;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health/system", get(health::system_health))
        .route("/health/bills", get(health::bills_health))
        .merge(buildings::router())
        .merge(rooms::router())
        .merge(renters::router())
        .merge(contracts::router())
        .merge(bills::router())
        .merge(meters::router())
        .merge(meter_readings::router())
        .merge(settings::router())
        .merge(dashboard::router())
}
