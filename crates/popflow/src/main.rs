use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use popflow_core::{
    config::PipelineConfig,
    extract, load,
    pipeline::Orchestrator,
    scheduler::Scheduler,
    table::{PopulationTable, Snapshot},
    transform,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Population dataset ETL job", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one extract → transform → load run, retrying per config
    Run,
    /// Trigger a run once per configured interval until interrupted
    Schedule(ScheduleArgs),
    /// Fetch the source dataset into scratch storage
    Extract,
    /// Transform a scratch snapshot and print a preview
    Transform(TransformArgs),
    /// Transform a scratch snapshot and load it into the destination table
    Load(SnapshotArgs),
    /// Create the destination table and key if they do not exist
    InitDb,
}

#[derive(Args, Debug, Default)]
struct ScheduleArgs {
    /// Stop after this many runs
    #[arg(long)]
    max_runs: Option<usize>,
}

#[derive(Args, Debug, Default)]
struct SnapshotArgs {
    /// Snapshot to read instead of the configured scratch path
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TransformArgs {
    #[command(flatten)]
    snapshot: SnapshotArgs,
    /// Number of rows to preview
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = PipelineConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Command::Run => handle_run(&config).await,
        Command::Schedule(args) => handle_schedule(&config, args).await,
        Command::Extract => handle_extract(&config).await,
        Command::Transform(args) => handle_transform(&config, args).await,
        Command::Load(args) => handle_load(&config, args).await,
        Command::InitDb => {
            load::init_schema(config.database_url()?).await?;
            info!(table = load::TABLE_NAME, "Destination schema ensured");
            Ok(())
        }
    }
}

async fn handle_run(config: &PipelineConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let report = orchestrator.run().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.succeeded() {
        Ok(())
    } else {
        anyhow::bail!(
            "run {} failed: {}",
            report.run_id,
            report.last_error().unwrap_or("unknown error")
        )
    }
}

async fn handle_schedule(config: &PipelineConfig, args: ScheduleArgs) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let scheduler = Scheduler::new(orchestrator, config.schedule_interval());

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let summary = scheduler.run_until(shutdown, args.max_runs).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn handle_extract(config: &PipelineConfig) -> Result<()> {
    let client = extract::build_client().context("failed to build HTTP client")?;
    let snapshot = extract::fetch_snapshot(&client, &config.source_url, &config.scratch_path)
        .await
        .with_context(|| format!("failed to extract {}", config.source_url))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn handle_transform(config: &PipelineConfig, args: TransformArgs) -> Result<()> {
    let table = transform_existing(config, &args.snapshot).await?;
    let records = table.records()?;

    let mut preview = Table::new();
    preview.set_header(vec![
        "year",
        "country",
        "population",
        "population_60_plus",
        "population_60_plus_percent",
    ]);
    for record in records.iter().take(args.limit) {
        preview.add_row(vec![
            record.year.to_string(),
            record.country.clone(),
            record.population.to_string(),
            record.population_60_plus.to_string(),
            record
                .population_60_plus_percent
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "NULL".into()),
        ]);
    }
    println!("{preview}");
    println!("{} of {} rows shown", records.len().min(args.limit), records.len());
    Ok(())
}

async fn handle_load(config: &PipelineConfig, args: SnapshotArgs) -> Result<()> {
    let database_url = config.database_url()?;
    let table = transform_existing(config, &args).await?;
    let receipt = load::load_into(database_url, &table)
        .await
        .context("failed to load population table")?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

async fn transform_existing(config: &PipelineConfig, args: &SnapshotArgs) -> Result<PopulationTable> {
    let path = args
        .snapshot
        .clone()
        .unwrap_or_else(|| config.scratch_path.clone());
    let snapshot = Snapshot::from_existing(&path)
        .with_context(|| format!("snapshot {} is not readable; run `extract` first", path.display()))?;
    let policy = config.zero_population;

    let table = tokio::task::spawn_blocking(move || transform::transform_snapshot(&snapshot, policy))
        .await?
        .with_context(|| format!("failed to transform {}", path.display()))?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_takes_snapshot_and_limit() {
        let cli = Cli::try_parse_from([
            "popflow",
            "--config",
            "popflow.toml",
            "transform",
            "--snapshot",
            "/var/tmp/pop.csv",
            "--limit",
            "3",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("popflow.toml")));
        match cli.command {
            Command::Transform(args) => {
                assert_eq!(args.snapshot.snapshot, Some(PathBuf::from("/var/tmp/pop.csv")));
                assert_eq!(args.limit, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn transform_preview_defaults_to_ten_rows() {
        let cli = Cli::try_parse_from(["popflow", "transform"]).unwrap();
        match cli.command {
            Command::Transform(args) => {
                assert_eq!(args.snapshot.snapshot, None);
                assert_eq!(args.limit, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn schedule_accepts_max_runs_and_global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["popflow", "schedule", "--max-runs", "2", "--config", "p.toml"])
                .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("p.toml")));
        match cli.command {
            Command::Schedule(args) => assert_eq!(args.max_runs, Some(2)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn init_db_is_kebab_case_and_unknown_commands_fail() {
        let cli = Cli::try_parse_from(["popflow", "init-db"]).unwrap();
        assert!(matches!(cli.command, Command::InitDb));
        assert!(Cli::try_parse_from(["popflow", "migrate"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
