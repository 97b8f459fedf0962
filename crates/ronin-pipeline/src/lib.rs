//! Pipeline orchestration: seed fetch, follow-up resolution, the stage
//! runner behind the tracer, and the plain nightly runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ronin_core::{
    ExecutionContext, FollowupKind, SourceKind, StageDef, TraceEntry, TraceLog, NIGHTLY_PIPELINE,
    TRACE_PIPELINE,
};
use ronin_store::{PgStore, SqlParam, StoreError, TraceStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ronin-pipeline";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("no raw row for source {source_kind} at offset {offset}")]
    SeedNotFound { source_kind: SourceKind, offset: u32 },
    #[error("store row: {0}")]
    MalformedRow(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub transforms_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub nightly_cron: String,
}

impl PipelineConfig {
    /// `DATABASE_URL` is required; everything else has a default. Reported
    /// before any store contact.
    pub fn from_env() -> Result<Self, PipelineError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| PipelineError::Config("DATABASE_URL not set".to_string()))?;
        Ok(Self {
            database_url,
            transforms_dir: std::env::var("TRANSFORMS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("transforms/sql")),
            scheduler_enabled: std::env::var("RONIN_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            nightly_cron: std::env::var("NIGHTLY_CRON").unwrap_or_else(|_| "0 2 * * *".to_string()),
        })
    }
}

/// One read-only diagnostic query plus the context values that parameterize
/// it. Never persisted beyond the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowupQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Resolved follow-up work for one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Followup {
    /// Run the query, record its rows.
    Query(FollowupQuery),
    /// Run the lookup; when it matches, record the first row's company id
    /// into the context and run the alias query for it within the same step.
    CompanyResolution {
        lookup: FollowupQuery,
        alias_sql: &'static str,
    },
}

const UNIFIED_BY_SEED: &str =
    "SELECT * FROM silver.unified WHERE source = $1 AND source_id = $2";
const COMPANY_BY_UNIFIED_NAME: &str = "SELECT * FROM gold.company WHERE name = \
     (SELECT company_name FROM silver.unified WHERE source = $1 AND source_id = $2)";
const ALIASES_BY_COMPANY: &str =
    "SELECT * FROM gold.company_alias WHERE company_id::text = $1";
const EVIDENCE_BY_COMPANY: &str =
    "SELECT * FROM gold.company_evidence_domain WHERE company_id::text = $1";
const COMPANY_BY_ID: &str = "SELECT * FROM gold.company WHERE company_id::text = $1";
const MONITORING_BY_COMPANY: &str =
    "SELECT * FROM gold.company_monitoring_checks WHERE company_id::text = $1";

/// Decide which diagnostic queries run after `stage`, given what the run has
/// learned so far. Pure; the runner owns all store access.
pub fn followups(stage: &StageDef, ctx: &ExecutionContext) -> Vec<Followup> {
    match stage.followup {
        FollowupKind::None => Vec::new(),
        FollowupKind::Silver(kind) if kind == ctx.source => vec![Followup::Query(FollowupQuery {
            sql: format!("SELECT * FROM {} WHERE source_id = $1", kind.silver_table()),
            params: vec![SqlParam::Text(ctx.source_id.clone())],
        })],
        FollowupKind::Silver(_) => Vec::new(),
        FollowupKind::Unified => vec![Followup::Query(FollowupQuery {
            sql: UNIFIED_BY_SEED.to_string(),
            params: seed_params(ctx),
        })],
        FollowupKind::CompanyUpsert => vec![Followup::CompanyResolution {
            lookup: FollowupQuery {
                sql: COMPANY_BY_UNIFIED_NAME.to_string(),
                params: seed_params(ctx),
            },
            alias_sql: ALIASES_BY_COMPANY,
        }],
        FollowupKind::CompanyEvidence => company_scoped(ctx, EVIDENCE_BY_COMPANY),
        FollowupKind::CompanyLookup => company_scoped(ctx, COMPANY_BY_ID),
        FollowupKind::MonitoringChecks => company_scoped(ctx, MONITORING_BY_COMPANY),
    }
}

fn seed_params(ctx: &ExecutionContext) -> Vec<SqlParam> {
    vec![
        SqlParam::Text(ctx.source.as_str().to_string()),
        SqlParam::Text(ctx.source_id.clone()),
    ]
}

fn company_scoped(ctx: &ExecutionContext, sql: &str) -> Vec<Followup> {
    match ctx.company_id() {
        Some(id) => vec![Followup::Query(FollowupQuery {
            sql: sql.to_string(),
            params: vec![SqlParam::Text(id.to_string())],
        })],
        None => Vec::new(),
    }
}

/// Fetch the seed row for `source` at `offset` and derive the execution
/// context from it. Exactly one store round-trip happens before a
/// `SeedNotFound` is reported.
pub async fn fetch_seed<S: TraceStore>(
    store: &mut S,
    source: SourceKind,
    offset: u32,
) -> Result<(ExecutionContext, TraceEntry), PipelineError> {
    let rows = store
        .query_rows(source.seed_query(), &[SqlParam::Int(i64::from(offset))])
        .await?;
    let Some(row) = rows.first() else {
        return Err(PipelineError::SeedNotFound { source_kind: source, offset });
    };
    let source_id = row
        .get("source_id")
        .and_then(json_scalar_text)
        .ok_or_else(|| {
            PipelineError::MalformedRow(format!("seed row for {source} carries no source_id"))
        })?;
    let ctx = ExecutionContext::new(source, source_id);
    Ok((ctx, TraceEntry::raw(source.raw_table(), rows)))
}

/// Replay the full trace pipeline for one seed record and return the
/// assembled trace.
pub async fn run_trace<S: TraceStore>(
    store: &mut S,
    transforms_dir: &Path,
    source: SourceKind,
    offset: u32,
) -> Result<TraceLog, PipelineError> {
    let mut log = TraceLog::default();
    let (mut ctx, raw_entry) = fetch_seed(store, source, offset).await?;
    info!(source = %source, source_id = %ctx.source_id, "seed fetched");
    log.push(raw_entry);
    run_stages(store, transforms_dir, TRACE_PIPELINE, &mut ctx, &mut log).await?;
    Ok(log)
}

/// Execute `stages` in order: submit each statement, then run and record the
/// stage's resolved follow-up queries. Stage N+1 never starts before stage N
/// and all of its follow-ups complete; any failure aborts the whole run.
pub async fn run_stages<S: TraceStore>(
    store: &mut S,
    transforms_dir: &Path,
    stages: &[StageDef],
    ctx: &mut ExecutionContext,
    log: &mut TraceLog,
) -> Result<(), PipelineError> {
    for stage in stages {
        let sql = read_stage_sql(transforms_dir, stage)?;
        info!(stage = stage.name, "executing transform");
        store.execute(&sql).await?;

        for followup in followups(stage, ctx) {
            match followup {
                Followup::Query(query) => {
                    let rows = store.query_rows(&query.sql, &query.params).await?;
                    log.push(TraceEntry::stage(stage.name, &query.sql, rows));
                }
                Followup::CompanyResolution { lookup, alias_sql } => {
                    let rows = store.query_rows(&lookup.sql, &lookup.params).await?;
                    let matched = rows.first().cloned();
                    log.push(TraceEntry::stage(stage.name, &lookup.sql, rows));
                    if let Some(row) = matched {
                        let company_id =
                            row.get("company_id").and_then(json_scalar_text).ok_or_else(|| {
                                PipelineError::MalformedRow(
                                    "company row carries no company_id".to_string(),
                                )
                            })?;
                        ctx.record_company_id(company_id.clone());
                        let alias_rows = store
                            .query_rows(alias_sql, &[SqlParam::Text(company_id)])
                            .await?;
                        log.push(TraceEntry::stage(stage.name, alias_sql, alias_rows));
                    }
                }
            }
        }
    }
    Ok(())
}

fn read_stage_sql(transforms_dir: &Path, stage: &StageDef) -> Result<String, PipelineError> {
    let path = transforms_dir.join(stage.file);
    std::fs::read_to_string(&path).map_err(|err| {
        PipelineError::Config(format!("reading stage file {}: {err}", path.display()))
    })
}

fn json_scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NightlyRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub statements: usize,
}

/// Run the nightly stage list inside one explicit transaction, committing
/// only after the final statement. The tracer, by contrast, runs
/// autocommit so each stage's effects are visible to its follow-ups.
pub async fn run_nightly<S: TraceStore>(
    store: &mut S,
    transforms_dir: &Path,
) -> Result<NightlyRunSummary, PipelineError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    store.execute("BEGIN").await?;
    let mut statements = 0usize;
    for stage in NIGHTLY_PIPELINE {
        let sql = read_stage_sql(transforms_dir, stage)?;
        info!(%run_id, stage = stage.name, "running nightly stage");
        store.execute(&sql).await?;
        statements += 1;
    }
    store.execute("COMMIT").await?;
    Ok(NightlyRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        statements,
    })
}

/// Connect, trace, and hand back the log. The connection is scoped to this
/// call.
pub async fn run_trace_once(
    config: &PipelineConfig,
    source: SourceKind,
    offset: u32,
) -> Result<TraceLog, PipelineError> {
    let mut store = PgStore::connect(&config.database_url).await?;
    run_trace(&mut store, &config.transforms_dir, source, offset).await
}

pub async fn run_nightly_once(config: &PipelineConfig) -> Result<NightlyRunSummary, PipelineError> {
    let mut store = PgStore::connect(&config.database_url).await?;
    run_nightly(&mut store, &config.transforms_dir).await
}

/// Build the nightly scheduler when enabled.
pub async fn maybe_build_scheduler(config: &PipelineConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.nightly_cron.clone();
    let job_config = config.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_nightly_once(&config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    statements = summary.statements,
                    "nightly run complete"
                ),
                Err(err) => error!(error = %err, "nightly run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
