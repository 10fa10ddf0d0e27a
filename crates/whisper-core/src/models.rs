//! Core data models for the extraction pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;

// =============================================================================
// DOCUMENT TYPES
// =============================================================================

/// One uploaded file. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    /// BLAKE3 fingerprint of the bytes, `blake3:<hex>`.
    pub content_hash: String,
    pub page_count: u32,
    pub size_bytes: u64,
    pub filename: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Caller-supplied metadata accompanying an upload.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub filename: Option<String>,
    /// Content type declared by the client. Informational; the bytes decide.
    pub content_type: Option<String>,
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Lifecycle state of an extraction job.
///
/// `queued -> processing -> {complete, error}`; `queued -> error` is allowed
/// for timeouts that fire before a worker picks the job up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Complete,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Complete => "complete",
            JobState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Processing)
                | (JobState::Queued, JobState::Error)
                | (JobState::Processing, JobState::Complete)
                | (JobState::Processing, JobState::Error)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "complete" => Ok(JobState::Complete),
            "error" => Ok(JobState::Error),
            other => Err(crate::Error::Internal(format!(
                "unknown job state '{}'",
                other
            ))),
        }
    }
}

/// One extraction attempt for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub document_id: Uuid,
    pub state: JobState,
    /// 0..=100, non-decreasing.
    pub progress: u8,
    /// Set only in `error`.
    pub error_message: Option<String>,
    /// 0 for the first attempt, incremented on each automatic retry.
    pub attempt: u32,
    /// Job this one automatically retries.
    pub retry_of: Option<Uuid>,
    /// Job created to automatically retry this one.
    pub retry_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly queued job.
    pub fn queued(id: Uuid, document_id: Uuid, attempt: u32, retry_of: Option<Uuid>) -> Self {
        Self {
            id,
            document_id,
            state: JobState::Queued,
            progress: 0,
            error_message: None,
            attempt,
            retry_of,
            retry_job_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Polling view of this job.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            state: self.state,
            progress: self.progress,
            error: self.error_message.clone(),
            retry_job_id: self.retry_job_id,
        }
    }
}

/// What a polling client sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_job_id: Option<Uuid>,
}

/// One entry of a job's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransition {
    pub state: JobState,
    pub progress: u8,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Returned by the ingestion gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub document_id: Uuid,
    pub state: JobState,
    /// True when an existing job was returned instead of creating one.
    pub reused: bool,
}

impl JobHandle {
    pub fn for_job(job: &Job, reused: bool) -> Self {
        Self {
            job_id: job.id,
            document_id: job.document_id,
            state: job.state,
            reused,
        }
    }
}

// =============================================================================
// EXTRACTION RECORD
// =============================================================================

/// Confidence section names.
pub mod sections {
    pub const TOTALS: &str = "totals";
    pub const T12: &str = "t12";
    pub const RENT_ROLL: &str = "rentRoll";
    pub const DEBT_TERMS: &str = "debtTerms";
    pub const COVENANTS: &str = "covenants";
    pub const ASSUMPTIONS: &str = "assumptions";

    pub const ALL: [&str; 6] = [TOTALS, T12, RENT_ROLL, DEBT_TERMS, COVENANTS, ASSUMPTIONS];
}

/// Headline financial figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub gpr: Option<Money>,
    pub vacancy: Option<Money>,
    pub egi: Option<Money>,
    pub opex: Option<Money>,
    pub noi: Option<Money>,
    pub annual_debt_service: Option<Money>,
    /// Rounded to two decimals.
    pub dscr: Option<f64>,
}

/// One line of the trailing-twelve-month statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct T12Line {
    /// `YYYY-MM`
    pub month: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub amount: Money,
    pub source_page: Option<u32>,
}

/// One rent-roll row. `tenant_name` is always a pseudonym.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RentRollEntry {
    pub unit_id: String,
    pub tenant_name: Option<String>,
    pub sqft: Option<u32>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub base_rent: Option<Money>,
    pub escalations: Option<String>,
    pub source_page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateType {
    Fixed,
    Floating,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtTerms {
    pub lender: Option<String>,
    pub principal: Option<Money>,
    pub rate_type: Option<RateType>,
    pub index: Option<String>,
    pub spread_bps: Option<u32>,
    /// Percent, e.g. `6.25`.
    pub all_in_rate: Option<f64>,
    pub amortization_months: Option<u32>,
    pub io_months: Option<u32>,
    pub maturity_date: Option<NaiveDate>,
    pub rate_cap: Option<f64>,
    pub source_page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Covenant {
    #[serde(rename = "type")]
    pub covenant_type: String,
    pub threshold: Option<f64>,
    pub frequency: Option<String>,
    pub source_page: Option<u32>,
}

/// Page reference backing a footnote or figure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Free-text footnoted assumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assumption {
    pub text: String,
    #[serde(default)]
    pub source_refs: Vec<SourceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        })
    }
}

/// Output of one reconciliation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub id: String,
    pub label: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Check {
    pub fn new(id: &str, label: &str, status: CheckStatus) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            status,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A derived figure: an amount or a ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Figure {
    Money(Money),
    Ratio(f64),
}

impl Figure {
    pub fn as_f64(&self) -> f64 {
        match self {
            Figure::Money(m) => m.cents() as f64,
            Figure::Ratio(r) => *r,
        }
    }
}

/// Extracted vs recomputed value of a derived field. Both are kept so a
/// disagreement stays visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Derivation {
    /// `egi`, `noi` or `dscr`
    pub field: String,
    pub extracted: Option<Figure>,
    pub recomputed: Option<Figure>,
    pub relative_diff: Option<f64>,
    pub within_tolerance: Option<bool>,
}

/// Audit trail entry: which page backs which published figure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    /// Dotted path of the figure, e.g. `totals.noi` or `rentRoll[3].baseRent`.
    pub figure: String,
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// The reconciled, published result of one completed job. Read-only once
/// published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRecord {
    pub document_id: Uuid,
    pub job_id: Uuid,
    pub totals: Totals,
    pub derivations: Vec<Derivation>,
    pub t12_lines: Vec<T12Line>,
    pub rent_roll: Vec<RentRollEntry>,
    pub debt_terms: Option<DebtTerms>,
    pub covenants: Vec<Covenant>,
    pub assumptions: Vec<Assumption>,
    pub checks: Vec<Check>,
    pub confidences: BTreeMap<String, f64>,
    pub provenance: Vec<ProvenanceEntry>,
    pub reconciled_at: DateTime<Utc>,
}

impl ExtractionRecord {
    /// First check with the given rule id.
    pub fn check(&self, id: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.id == id)
    }

    /// Distinct source pages referenced anywhere in the provenance trail,
    /// ascending.
    pub fn referenced_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.provenance.iter().map(|p| p.page).collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_transitions() {
        use JobState::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Queued.can_transition_to(Error));
        assert!(Processing.can_transition_to(Complete));
        assert!(Processing.can_transition_to(Error));

        assert!(!Queued.can_transition_to(Complete));
        for terminal in [Complete, Error] {
            assert!(terminal.is_terminal());
            for next in [Queued, Processing, Complete, Error] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn job_state_round_trips_through_str() {
        for state in [
            JobState::Queued,
            JobState::Processing,
            JobState::Complete,
            JobState::Error,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn job_status_omits_absent_error() {
        let job = Job::queued(Uuid::nil(), Uuid::nil(), 0, None);
        let json = serde_json::to_value(job.status()).unwrap();
        assert_eq!(json, serde_json::json!({"state": "queued", "progress": 0}));
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = ExtractionRecord {
            document_id: Uuid::nil(),
            job_id: Uuid::nil(),
            totals: Totals {
                annual_debt_service: Some(Money::from_dollars(100)),
                dscr: Some(1.15),
                ..Default::default()
            },
            derivations: vec![],
            t12_lines: vec![],
            rent_roll: vec![],
            debt_terms: None,
            covenants: vec![Covenant {
                covenant_type: "dscr".into(),
                threshold: Some(1.2),
                frequency: None,
                source_page: Some(4),
            }],
            assumptions: vec![],
            checks: vec![],
            confidences: BTreeMap::new(),
            provenance: vec![],
            reconciled_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["totals"]["annualDebtService"], 10_000);
        assert_eq!(json["totals"]["dscr"], 1.15);
        assert!(json.get("t12Lines").is_some());
        assert!(json.get("rentRoll").is_some());
        assert_eq!(json["covenants"][0]["type"], "dscr");
        assert_eq!(json["covenants"][0]["sourcePage"], 4);
    }

    #[test]
    fn figure_untagged_round_trip() {
        let money: Figure = serde_json::from_str("120000").unwrap();
        assert_eq!(money, Figure::Money(Money::from_cents(120_000)));
        let ratio: Figure = serde_json::from_str("1.15").unwrap();
        assert_eq!(ratio, Figure::Ratio(1.15));
    }

    #[test]
    fn referenced_pages_are_sorted_and_unique() {
        let mut record: ExtractionRecord = serde_json::from_value(serde_json::json!({
            "documentId": Uuid::nil(),
            "jobId": Uuid::nil(),
            "totals": {},
            "derivations": [],
            "t12Lines": [],
            "rentRoll": [],
            "debtTerms": null,
            "covenants": [],
            "assumptions": [],
            "checks": [],
            "confidences": {},
            "provenance": [],
            "reconciledAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        for page in [3, 1, 3, 2] {
            record.provenance.push(ProvenanceEntry {
                figure: "x".into(),
                page,
                snippet: None,
            });
        }
        assert_eq!(record.referenced_pages(), vec![1, 2, 3]);
    }
}
