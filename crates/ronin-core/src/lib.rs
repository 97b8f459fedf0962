//! Core domain model for the JobRonin transform pipeline and tracer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ronin-core";

/// A recognized scrape source. The set is closed: anything else is a
/// configuration error, never silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Jobspy,
    ProfesiaSk,
    Stepstone,
}

#[derive(Debug, Error)]
#[error("unrecognized source {0:?}; expected one of jobspy, profesia_sk, stepstone")]
pub struct UnknownSource(pub String);

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::Jobspy,
        SourceKind::ProfesiaSk,
        SourceKind::Stepstone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Jobspy => "jobspy",
            SourceKind::ProfesiaSk => "profesia_sk",
            SourceKind::Stepstone => "stepstone",
        }
    }

    pub fn raw_table(&self) -> &'static str {
        match self {
            SourceKind::Jobspy => "public.jobspy_job_scrape",
            SourceKind::ProfesiaSk => "public.profesiask_job_scrape",
            SourceKind::Stepstone => "public.stepstone_job_scrape",
        }
    }

    pub fn silver_table(&self) -> &'static str {
        match self {
            SourceKind::Jobspy => "silver.jobspy",
            SourceKind::ProfesiaSk => "silver.profesia_sk",
            SourceKind::Stepstone => "silver.stepstone",
        }
    }

    /// Seed-selection query: newest-first on the source's recency column,
    /// one row at the bound offset. The `source_id` expression here is the
    /// same derivation the source's silver transform uses as its join key;
    /// the two must stay in lockstep or source-scoped follow-up queries
    /// match nothing.
    pub fn seed_query(&self) -> &'static str {
        match self {
            SourceKind::Jobspy => {
                "SELECT id::text AS source_id, * \
                 FROM public.jobspy_job_scrape \
                 ORDER BY id DESC OFFSET $1 LIMIT 1"
            }
            SourceKind::ProfesiaSk => {
                "SELECT md5(util.json_clean(job_data)->>'job_url') AS source_id, * \
                 FROM public.profesiask_job_scrape \
                 ORDER BY scraped_at DESC OFFSET $1 LIMIT 1"
            }
            SourceKind::Stepstone => {
                "SELECT id::text AS source_id, * \
                 FROM public.stepstone_job_scrape \
                 ORDER BY \"timestamp\" DESC OFFSET $1 LIMIT 1"
            }
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Which diagnostic follow-up applies after a stage runs. Carried as data on
/// the stage itself so the decision table stays exhaustively checkable
/// instead of being inferred from stage names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowupKind {
    None,
    /// Silver rows for the seed, only when the stage's source is the run's.
    Silver(SourceKind),
    /// Unified rows for (source, source_id).
    Unified,
    /// Company row by the unified row's company name; on a match, aliases too.
    CompanyUpsert,
    /// Evidence rows for the resolved company.
    CompanyEvidence,
    /// The company row itself, re-read after an enrichment stage.
    CompanyLookup,
    /// Monitoring-check rows for the resolved company.
    MonitoringChecks,
}

/// One ordered unit of transform work: a named stage backed by a statement
/// file, plus its follow-up kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDef {
    pub name: &'static str,
    pub file: &'static str,
    pub followup: FollowupKind,
}

const EXTENSIONS: StageDef = StageDef {
    name: "extensions",
    file: "00_extensions.sql",
    followup: FollowupKind::None,
};
const JOBSPY_RAW: StageDef = StageDef {
    name: "jobspy_raw",
    file: "00_jobspy_raw.sql",
    followup: FollowupKind::None,
};
const UTIL_FUNCTIONS: StageDef = StageDef {
    name: "util_functions",
    file: "04_util_functions.sql",
    followup: FollowupKind::None,
};
const SILVER_JOBSPY: StageDef = StageDef {
    name: "silver_jobspy",
    file: "01_silver_jobspy.sql",
    followup: FollowupKind::Silver(SourceKind::Jobspy),
};
const SILVER_PROFESIA_SK: StageDef = StageDef {
    name: "silver_profesia_sk",
    file: "02_silver_profesia_sk.sql",
    followup: FollowupKind::Silver(SourceKind::ProfesiaSk),
};
const SILVER_STEPSTONE: StageDef = StageDef {
    name: "silver_stepstone",
    file: "02_silver_stepstone.sql",
    followup: FollowupKind::Silver(SourceKind::Stepstone),
};
const UNIFIED_STAGE: StageDef = StageDef {
    name: "unified_stage",
    file: "03_unified_stage.sql",
    followup: FollowupKind::Unified,
};
const GOLD_COMPANY: StageDef = StageDef {
    name: "gold_company",
    file: "10_gold_company.sql",
    followup: FollowupKind::None,
};
const COMPANY_BRAND_RULES: StageDef = StageDef {
    name: "company_brand_rules",
    file: "12c_company_brand_rules.sql",
    followup: FollowupKind::None,
};
const COMPANIES_UPSERT: StageDef = StageDef {
    name: "companies_upsert",
    file: "12a_companies_upsert.sql",
    followup: FollowupKind::CompanyUpsert,
};
const COMPANY_EVIDENCE: StageDef = StageDef {
    name: "company_evidence",
    file: "12a_company_evidence.sql",
    followup: FollowupKind::CompanyEvidence,
};
const COMPANY_PROMOTE_DOMAIN: StageDef = StageDef {
    name: "company_promote_domain",
    file: "12e_company_promote_domain.sql",
    followup: FollowupKind::CompanyLookup,
};
const COMPANY_FILL_NULLS: StageDef = StageDef {
    name: "company_fill_nulls",
    file: "12b_company_fill_nulls.sql",
    followup: FollowupKind::None,
};
const COMPANY_DOMAIN_FROM_EVIDENCE: StageDef = StageDef {
    name: "company_domain_from_evidence",
    file: "12c_company_domain_from_evidence.sql",
    followup: FollowupKind::CompanyLookup,
};
const COMPANY_LINKEDIN: StageDef = StageDef {
    name: "company_linkedin",
    file: "12f_company_linkedin.sql",
    followup: FollowupKind::CompanyLookup,
};
const COMPANY_MONITORING_CHECKS: StageDef = StageDef {
    name: "company_monitoring_checks",
    file: "12d_company_monitoring_checks.sql",
    followup: FollowupKind::MonitoringChecks,
};

/// Total stage order for the tracer. Execution order in every trace is
/// exactly this order.
pub const TRACE_PIPELINE: &[StageDef] = &[
    EXTENSIONS,
    JOBSPY_RAW,
    UTIL_FUNCTIONS,
    SILVER_JOBSPY,
    SILVER_PROFESIA_SK,
    SILVER_STEPSTONE,
    UNIFIED_STAGE,
    GOLD_COMPANY,
    COMPANY_BRAND_RULES,
    COMPANIES_UPSERT,
    COMPANY_EVIDENCE,
    COMPANY_PROMOTE_DOMAIN,
    COMPANY_DOMAIN_FROM_EVIDENCE,
    COMPANY_LINKEDIN,
    COMPANY_MONITORING_CHECKS,
];

/// Stage order for the plain nightly run. Shares stage definitions with the
/// trace pipeline; `company_fill_nulls` runs only here.
pub const NIGHTLY_PIPELINE: &[StageDef] = &[
    UTIL_FUNCTIONS,
    SILVER_JOBSPY,
    SILVER_PROFESIA_SK,
    SILVER_STEPSTONE,
    UNIFIED_STAGE,
    GOLD_COMPANY,
    COMPANY_BRAND_RULES,
    COMPANIES_UPSERT,
    COMPANY_EVIDENCE,
    COMPANY_PROMOTE_DOMAIN,
    COMPANY_FILL_NULLS,
    COMPANY_DOMAIN_FROM_EVIDENCE,
];

/// Identifiers a trace run has learned so far. `source` and `source_id` are
/// fixed at seed time; `company_id` appears once company resolution matches
/// and is never replaced within the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub source: SourceKind,
    pub source_id: String,
    company_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(source: SourceKind, source_id: impl Into<String>) -> Self {
        Self {
            source,
            source_id: source_id.into(),
            company_id: None,
        }
    }

    pub fn company_id(&self) -> Option<&str> {
        self.company_id.as_deref()
    }

    /// First write wins; later calls within the same run are ignored.
    pub fn record_company_id(&mut self, id: impl Into<String>) {
        if self.company_id.is_none() {
            self.company_id = Some(id.into());
        }
    }
}

/// One observed query and its rows. The raw fetch carries the table it read
/// from; stage entries carry the query text instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub rows: Vec<JsonValue>,
}

impl TraceEntry {
    pub fn raw(table: &str, rows: Vec<JsonValue>) -> Self {
        Self {
            step: "raw".to_string(),
            table: Some(table.to_string()),
            query: None,
            rows,
        }
    }

    pub fn stage(step: &str, query: &str, rows: Vec<JsonValue>) -> Self {
        Self {
            step: step.to_string(),
            table: None,
            query: Some(query.to_string()),
            rows,
        }
    }
}

/// Append-only record of everything a trace run observed, in execution
/// order. Zero-row results are recorded like any other.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TraceLog {
    entries: Vec<TraceEntry>,
}

impl TraceLog {
    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_kind_round_trips_through_str() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_source_is_rejected() {
        let err = "linkedin".parse::<SourceKind>().unwrap_err();
        assert!(err.to_string().contains("linkedin"));
    }

    #[test]
    fn every_source_has_tables_and_a_seed_query() {
        for kind in SourceKind::ALL {
            assert!(kind.raw_table().starts_with("public."));
            assert!(kind.silver_table().starts_with("silver."));
            assert!(kind.seed_query().contains("AS source_id"));
            assert!(kind.seed_query().contains("OFFSET $1 LIMIT 1"));
        }
    }

    #[test]
    fn trace_pipeline_names_are_unique() {
        let mut names: Vec<_> = TRACE_PIPELINE.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), TRACE_PIPELINE.len());
    }

    #[test]
    fn trace_pipeline_covers_every_source_with_a_silver_stage() {
        for kind in SourceKind::ALL {
            assert!(TRACE_PIPELINE
                .iter()
                .any(|s| s.followup == FollowupKind::Silver(kind)));
        }
    }

    #[test]
    fn nightly_stages_reuse_trace_definitions() {
        for stage in NIGHTLY_PIPELINE {
            if stage.name == "company_fill_nulls" {
                continue;
            }
            assert!(
                TRACE_PIPELINE.iter().any(|s| s == stage),
                "{} missing from trace pipeline",
                stage.name
            );
        }
    }

    #[test]
    fn company_id_is_never_overwritten() {
        let mut ctx = ExecutionContext::new(SourceKind::Jobspy, "77");
        assert_eq!(ctx.company_id(), None);
        ctx.record_company_id("12");
        ctx.record_company_id("99");
        assert_eq!(ctx.company_id(), Some("12"));
    }

    #[test]
    fn trace_log_renders_in_insertion_order() {
        let mut log = TraceLog::default();
        log.push(TraceEntry::raw(
            "public.jobspy_job_scrape",
            vec![json!({"source_id": "7"})],
        ));
        log.push(TraceEntry::stage(
            "silver_jobspy",
            "SELECT * FROM silver.jobspy WHERE source_id = $1",
            vec![],
        ));

        let rendered: Vec<serde_json::Value> =
            serde_json::from_str(&log.render_json().unwrap()).unwrap();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0]["step"], "raw");
        assert_eq!(rendered[0]["table"], "public.jobspy_job_scrape");
        assert!(rendered[0].get("query").is_none());
        assert_eq!(rendered[1]["step"], "silver_jobspy");
        assert!(rendered[1].get("table").is_none());
        assert_eq!(rendered[1]["rows"], json!([]));
    }
}
