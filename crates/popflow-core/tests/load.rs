use anyhow::Result;
use popflow_core::db;
use popflow_core::error::LoadError;
use popflow_core::load::{init_schema, load_into};
use popflow_core::table::{PopulationRecord, PopulationTable};
use sqlx::{AnyConnection, Connection};
use tempfile::TempDir;

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("popflow.db").display())
}

async fn execute(url: &str, sql: &str) -> Result<()> {
    let mut conn = db::connect(url).await?;
    sqlx::query(sql).execute(&mut conn).await?;
    conn.close().await?;
    Ok(())
}

async fn row_count(url: &str) -> Result<i64> {
    let mut conn = db::connect(url).await?;
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM population")
        .fetch_one(&mut conn)
        .await?;
    conn.close().await?;
    Ok(count)
}

async fn stored_rows(url: &str) -> Result<Vec<(i64, String, i64, i64, Option<f64>)>> {
    let mut conn: AnyConnection = db::connect(url).await?;
    let rows = sqlx::query_as(
        r#"
            SELECT year, country, population, population_60_plus,
                   CAST(population_60_plus_percent AS REAL)
            FROM population
            ORDER BY year, country
        "#,
    )
    .fetch_all(&mut conn)
    .await?;
    conn.close().await?;
    Ok(rows)
}

fn batch(countries: &[&str]) -> PopulationTable {
    let records: Vec<PopulationRecord> = countries
        .iter()
        .enumerate()
        .map(|(i, country)| PopulationRecord::new(2023, *country, 1000 + i as i64 * 100, 100))
        .collect();
    PopulationTable::from_records(&records).unwrap()
}

#[tokio::test]
async fn creates_table_and_inserts_single_row() -> Result<()> {
    let dir = TempDir::new()?;
    let url = database_url(&dir);
    let table = PopulationTable::from_records(&[PopulationRecord::new(2023, "Testland", 1000, 100)])?;

    let receipt = load_into(&url, &table).await?;

    assert_eq!(receipt.rows_written, 1);
    assert_eq!(receipt.table, "population");
    assert_eq!(
        stored_rows(&url).await?,
        vec![(2023, "Testland".to_string(), 1000, 100, Some(10.0))]
    );
    Ok(())
}

#[tokio::test]
async fn reloading_upserts_instead_of_duplicating() -> Result<()> {
    let dir = TempDir::new()?;
    let url = database_url(&dir);

    load_into(&url, &batch(&["Alphaland", "Betaland", "Gammaland"])).await?;
    load_into(&url, &batch(&["Alphaland", "Betaland", "Gammaland"])).await?;
    assert_eq!(row_count(&url).await?, 3);

    let revised = PopulationTable::from_records(&[PopulationRecord::new(2023, "Betaland", 400, 100)])?;
    load_into(&url, &revised).await?;

    let rows = stored_rows(&url).await?;
    assert_eq!(rows.len(), 3);
    let beta = rows.iter().find(|row| row.1 == "Betaland").unwrap();
    assert_eq!((beta.2, beta.4), (400, Some(25.0)));
    Ok(())
}

#[tokio::test]
async fn failure_on_last_row_commits_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let url = database_url(&dir);

    // A stricter pre-existing table: creation is skipped and the constraint
    // rejects the final row of the batch.
    execute(
        &url,
        r#"
            CREATE TABLE population (
                year INT,
                country VARCHAR(100) CHECK (country <> 'Atlantis'),
                population INT,
                population_60_plus INT,
                population_60_plus_percent DECIMAL
            )
        "#,
    )
    .await?;

    let mut countries: Vec<String> = (0..9).map(|i| format!("Country {i}")).collect();
    countries.push("Atlantis".into());
    let names: Vec<&str> = countries.iter().map(String::as_str).collect();
    let table = batch(&names);
    assert_eq!(table.height(), 10);

    let err = load_into(&url, &table).await.unwrap_err();
    assert_eq!(err.failed_row(), Some(9));
    match err {
        LoadError::Row { year, country, .. } => {
            assert_eq!((year, country.as_str()), (2023, "Atlantis"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(row_count(&url).await?, 0);
    Ok(())
}

#[tokio::test]
async fn existing_columns_are_left_alone() -> Result<()> {
    let dir = TempDir::new()?;
    let url = database_url(&dir);
    execute(
        &url,
        r#"
            CREATE TABLE population (
                year INT,
                country VARCHAR(100),
                population INT,
                population_60_plus INT,
                population_60_plus_percent DECIMAL,
                note TEXT DEFAULT 'legacy'
            )
        "#,
    )
    .await?;

    load_into(&url, &batch(&["Alphaland"])).await?;

    let mut conn = db::connect(&url).await?;
    let (note,): (String,) = sqlx::query_as("SELECT note FROM population")
        .fetch_one(&mut conn)
        .await?;
    conn.close().await?;
    assert_eq!(note, "legacy");
    Ok(())
}

#[tokio::test]
async fn duplicated_legacy_rows_block_the_natural_key() -> Result<()> {
    let dir = TempDir::new()?;
    let url = database_url(&dir);
    init_schema(&url).await?;
    execute(&url, "DROP INDEX population_year_country_key").await?;
    execute(
        &url,
        "INSERT INTO population (year, country) VALUES (2020, 'Twinland'), (2020, 'Twinland')",
    )
    .await?;

    let err = load_into(&url, &batch(&["Alphaland"])).await.unwrap_err();
    assert!(matches!(err, LoadError::Schema(_)), "{err:?}");
    assert_eq!(row_count(&url).await?, 2);
    Ok(())
}

#[tokio::test]
async fn null_percentage_is_stored_as_null() -> Result<()> {
    let dir = TempDir::new()?;
    let url = database_url(&dir);
    let table = PopulationTable::from_records(&[PopulationRecord::new(2023, "Emptyland", 0, 0)])?;

    load_into(&url, &table).await?;

    assert_eq!(
        stored_rows(&url).await?,
        vec![(2023, "Emptyland".to_string(), 0, 0, None)]
    );
    Ok(())
}

#[tokio::test]
async fn unreachable_database_is_a_connect_error() {
    let dir = TempDir::new().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("missing").join("popflow.db").display()
    );

    let err = load_into(&url, &batch(&["Alphaland"])).await.unwrap_err();
    assert!(matches!(err, LoadError::Connect(_)), "{err:?}");
    assert_eq!(err.failed_row(), None);
}
