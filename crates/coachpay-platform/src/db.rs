use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};

const SCHEMA: &str = include_str!("schema.sql");

pub async fn connect_database(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Creates the tables this service writes to. Safe to run on every start.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply schema")?;
    Ok(())
}
