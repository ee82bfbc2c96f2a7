use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, RetryPolicy, ZeroPopulationPolicy};
use crate::error::{FetchError, PipelineError, Result};
use crate::extract::{build_client, fetch_snapshot};
use crate::load::{load_into, LoadReceipt};
use crate::table::{PopulationTable, Snapshot};
use crate::transform::transform_snapshot;

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self) -> Result<Snapshot>;
}

#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, snapshot: Snapshot) -> Result<PopulationTable>;
}

#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, table: &PopulationTable) -> Result<LoadReceipt>;
}

#[derive(Debug, Clone)]
pub struct HttpExtractor {
    client: Client,
    source_url: String,
    scratch_path: PathBuf,
}

impl HttpExtractor {
    pub fn new(client: Client, source_url: impl Into<String>, scratch_path: impl Into<PathBuf>) -> Self {
        Self {
            client,
            source_url: source_url.into(),
            scratch_path: scratch_path.into(),
        }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self) -> Result<Snapshot> {
        Ok(fetch_snapshot(&self.client, &self.source_url, &self.scratch_path).await?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvTransformer {
    policy: ZeroPopulationPolicy,
}

impl CsvTransformer {
    pub fn new(policy: ZeroPopulationPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Transformer for CsvTransformer {
    async fn transform(&self, snapshot: Snapshot) -> Result<PopulationTable> {
        let policy = self.policy;
        let table = task::spawn_blocking(move || transform_snapshot(&snapshot, policy)).await??;
        Ok(table)
    }
}

#[derive(Debug, Clone)]
pub struct SqlLoader {
    database_url: String,
}

impl SqlLoader {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl Loader for SqlLoader {
    async fn load(&self, table: &PopulationTable) -> Result<LoadReceipt> {
        Ok(load_into(&self.database_url, table).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Extracting,
    Extracted,
    Transforming,
    Transformed,
    Loading,
    Loaded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Loaded | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Extracting)
            | (Extracting, Extracted)
            | (Extracted, Transforming)
            | (Transforming, Transformed)
            | (Transformed, Loading)
            | (Loading, Loaded) => true,
            _ => false,
        }
    }

    /// Stage that is executing while the run sits in this state.
    pub fn active_stage(self) -> Option<Stage> {
        match self {
            RunState::Extracting => Some(Stage::Extract),
            RunState::Transforming => Some(Stage::Transform),
            RunState::Loading => Some(Stage::Load),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub attempt: u32,
    pub state: RunState,
    pub transitions: Vec<StateTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_loaded: Option<usize>,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Loaded
    }

    pub fn visited(&self) -> Vec<RunState> {
        let mut states = vec![RunState::Pending];
        states.extend(self.transitions.iter().map(|t| t.to));
        states
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub attempts: Vec<AttemptReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().and_then(|a| a.error.as_deref())
    }

    pub fn rows_loaded(&self) -> Option<usize> {
        self.attempts.last().and_then(|a| a.rows_loaded)
    }
}

struct AttemptTracker {
    run_id: Uuid,
    attempt: u32,
    state: RunState,
    transitions: Vec<StateTransition>,
}

impl AttemptTracker {
    fn new(run_id: Uuid, attempt: u32) -> Self {
        Self {
            run_id,
            attempt,
            state: RunState::Pending,
            transitions: Vec::new(),
        }
    }

    fn advance(&mut self, to: RunState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition { from, to });
        }
        info!(
            run_id = %self.run_id,
            attempt = self.attempt,
            from = ?from,
            to = ?to,
            "Run state changed"
        );
        self.transitions.push(StateTransition {
            from,
            to,
            at: Utc::now(),
        });
        self.state = to;
        Ok(())
    }

    fn finish(mut self, outcome: Result<LoadReceipt>) -> AttemptReport {
        match outcome {
            Ok(receipt) => AttemptReport {
                attempt: self.attempt,
                state: self.state,
                transitions: self.transitions,
                failed_stage: None,
                error: None,
                rows_loaded: Some(receipt.rows_written),
            },
            Err(err) => {
                let failed_stage = self.state.active_stage();
                if !self.state.is_terminal() {
                    // Always legal from a non-terminal state.
                    let _ = self.advance(RunState::Failed);
                }
                error!(
                    run_id = %self.run_id,
                    attempt = self.attempt,
                    stage = ?failed_stage,
                    error = %err,
                    "Run attempt failed"
                );
                AttemptReport {
                    attempt: self.attempt,
                    state: self.state,
                    transitions: self.transitions,
                    failed_stage,
                    error: Some(err.to_string()),
                    rows_loaded: None,
                }
            }
        }
    }
}

/// Chains extract → transform → load for one run, re-executing the whole run
/// according to its `RetryPolicy`.
pub struct Orchestrator {
    retry: RetryPolicy,
    extractor: Box<dyn Extractor>,
    transformer: Box<dyn Transformer>,
    loader: Box<dyn Loader>,
    run_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        retry: RetryPolicy,
        extractor: Box<dyn Extractor>,
        transformer: Box<dyn Transformer>,
        loader: Box<dyn Loader>,
    ) -> Self {
        Self {
            retry,
            extractor,
            transformer,
            loader,
            run_lock: Mutex::new(()),
        }
    }

    /// Wires the HTTP, CSV and SQL stages described by `config`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let database_url = config.database_url()?.to_string();
        let client = build_client().map_err(|source| FetchError::Request {
            url: config.source_url.clone(),
            source,
        })?;

        Ok(Self::new(
            config.retry_policy(),
            Box::new(HttpExtractor::new(
                client,
                config.source_url.clone(),
                config.scratch_path.clone(),
            )),
            Box::new(CsvTransformer::new(config.zero_population)),
            Box::new(SqlLoader::new(database_url)),
        ))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Executes one run. Concurrent callers are serialized so two runs never
    /// share the scratch snapshot.
    pub async fn run(&self) -> RunReport {
        let _guard = self.run_lock.lock().await;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let max_attempts = self.retry.max_attempts();
        let mut attempts = Vec::new();

        info!(%run_id, max_attempts, "Run started");
        for attempt in 1..=max_attempts {
            let mut tracker = AttemptTracker::new(run_id, attempt);
            let outcome = self.execute(&mut tracker).await;
            let report = tracker.finish(outcome);
            let succeeded = report.succeeded();
            attempts.push(report);

            if succeeded {
                break;
            }
            if attempt < max_attempts {
                warn!(
                    %run_id,
                    attempt,
                    delay_secs = self.retry.delay.as_secs_f64(),
                    "Retrying run after delay"
                );
                tokio::time::sleep(self.retry.delay).await;
            }
        }

        let outcome = if attempts.last().is_some_and(AttemptReport::succeeded) {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };
        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            attempts,
        };

        match report.outcome {
            RunOutcome::Succeeded => info!(
                %run_id,
                attempts = report.attempts.len(),
                rows = report.rows_loaded().unwrap_or_default(),
                "Run succeeded"
            ),
            RunOutcome::Failed => error!(
                %run_id,
                attempts = report.attempts.len(),
                error = report.last_error().unwrap_or_default(),
                "Run failed after exhausting retries"
            ),
        }
        report
    }

    async fn execute(&self, tracker: &mut AttemptTracker) -> Result<LoadReceipt> {
        tracker.advance(RunState::Extracting)?;
        let snapshot = self.extractor.extract().await?;
        tracker.advance(RunState::Extracted)?;

        tracker.advance(RunState::Transforming)?;
        let table = self.transformer.transform(snapshot).await?;
        tracker.advance(RunState::Transformed)?;

        tracker.advance(RunState::Loading)?;
        let receipt = self.loader.load(&table).await?;
        tracker.advance(RunState::Loaded)?;

        Ok(receipt)
    }
}
