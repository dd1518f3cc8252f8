#![forbid(unsafe_code)]

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Option<PgPool>> {
    let Some(url) = database_url else {
        info!("DATABASE_URL not set, using the in-memory store with the default workspace");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(3))
        .connect(url)
        .await?;

    info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await?;

    info!("Database migrations applied");

    Ok(Some(pool))
}
