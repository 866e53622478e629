use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;

/// Build the Postgres pool from config, if a database URL is set.
///
/// The pool connects lazily so startup never blocks on the database;
/// the health endpoint reports whether it is actually reachable.
pub fn build_pool(config: &AppConfig) -> Option<PgPool> {
    let url = config.database_url.as_deref()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections)
        .min_connections(config.db_pool_min_connections)
        .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
        .connect_lazy(url);

    match pool {
        Ok(pool) => Some(pool),
        Err(error) => {
            tracing::error!(error = %error, "Invalid DATABASE_URL, starting without a pool");
            None
        }
    }
}
