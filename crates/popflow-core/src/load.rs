use serde::Serialize;
use sqlx::{Any, AnyConnection, Connection, Transaction};
use tracing::{info, warn};

use crate::db;
use crate::error::LoadError;
use crate::table::{PopulationRecord, PopulationTable};

pub const TABLE_NAME: &str = "population";

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS population (
        year INT,
        country VARCHAR(100),
        population INT,
        population_60_plus INT,
        population_60_plus_percent DECIMAL
    )
"#;

// Kept as a separate index so tables created before the key existed pick it up
// without their columns being touched.
const CREATE_NATURAL_KEY: &str = r#"
    CREATE UNIQUE INDEX IF NOT EXISTS population_year_country_key
    ON population (year, country)
"#;

const UPSERT_RECORD: &str = r#"
    INSERT INTO population (year, country, population, population_60_plus, population_60_plus_percent)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (year, country) DO UPDATE SET
        population = EXCLUDED.population,
        population_60_plus = EXCLUDED.population_60_plus,
        population_60_plus_percent = EXCLUDED.population_60_plus_percent
"#;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LoadReceipt {
    pub table: &'static str,
    pub rows_written: usize,
}

/// Creates the destination table and its `(year, country)` key if absent.
/// Existing tables are never altered.
pub async fn ensure_schema(conn: &mut AnyConnection) -> Result<(), LoadError> {
    sqlx::query(CREATE_TABLE)
        .execute(&mut *conn)
        .await
        .map_err(LoadError::Schema)?;
    sqlx::query(CREATE_NATURAL_KEY)
        .execute(&mut *conn)
        .await
        .map_err(LoadError::Schema)?;
    Ok(())
}

/// Upserts every record of `table` inside one transaction. Either all rows are
/// committed or none are.
pub async fn load_table(
    conn: &mut AnyConnection,
    table: &PopulationTable,
) -> Result<LoadReceipt, LoadError> {
    ensure_schema(conn).await?;
    let records = table.records()?;

    let mut tx = conn.begin().await.map_err(LoadError::Begin)?;
    if let Err(err) = upsert_records(&mut tx, &records).await {
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "Rollback after failed load did not complete");
        }
        return Err(err);
    }
    tx.commit().await.map_err(LoadError::Commit)?;

    info!(table = TABLE_NAME, rows = records.len(), "Data loaded successfully");
    Ok(LoadReceipt {
        table: TABLE_NAME,
        rows_written: records.len(),
    })
}

async fn upsert_records(
    tx: &mut Transaction<'_, Any>,
    records: &[PopulationRecord],
) -> Result<(), LoadError> {
    for (row, record) in records.iter().enumerate() {
        sqlx::query(UPSERT_RECORD)
            .bind(record.year)
            .bind(record.country.as_str())
            .bind(record.population)
            .bind(record.population_60_plus)
            .bind(record.population_60_plus_percent)
            .execute(&mut **tx)
            .await
            .map_err(|source| LoadError::Row {
                row,
                year: record.year,
                country: record.country.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Connects, loads and disconnects. The connection is never reused across
/// invocations.
pub async fn load_into(
    database_url: &str,
    table: &PopulationTable,
) -> Result<LoadReceipt, LoadError> {
    let mut conn = db::connect(database_url).await?;
    let outcome = load_table(&mut conn, table).await;
    if let Err(err) = conn.close().await {
        warn!(error = %err, "Closing destination connection failed");
    }
    outcome
}

pub async fn init_schema(database_url: &str) -> Result<(), LoadError> {
    let mut conn = db::connect(database_url).await?;
    let outcome = ensure_schema(&mut conn).await;
    if let Err(err) = conn.close().await {
        warn!(error = %err, "Closing destination connection failed");
    }
    outcome
}
