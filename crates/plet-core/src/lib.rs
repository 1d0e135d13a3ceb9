//! Core domain model and deterministic identity for PLET.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "plet-core";

/// Document-store collection names. Identifiers within a collection are
/// always caller-assigned, never store-generated.
pub mod collections {
    pub const EVIDENCE: &str = "evidence";
    pub const PROMISES: &str = "promises";
    pub const BILL_STATUS: &str = "bill_status";
}

/// Kind of externally-sourced activity an evidence record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    BillStage,
    News,
    RegulatoryNotice,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::BillStage,
        SourceType::News,
        SourceType::RegulatoryNotice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::BillStage => "bill-stage",
            SourceType::News => "news",
            SourceType::RegulatoryNotice => "regulatory-notice",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SourceType {}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bill-stage" => Ok(SourceType::BillStage),
            "news" => Ok(SourceType::News),
            "regulatory-notice" => Ok(SourceType::RegulatoryNotice),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

/// Identity of a bill in the external registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillKey {
    pub parliament: u32,
    pub session: u32,
    pub code: String,
}

impl BillKey {
    pub fn new(parliament: u32, session: u32, code: impl Into<String>) -> Self {
        Self {
            parliament,
            session,
            code: code.into(),
        }
    }

    /// Document-store identifier for this bill's status record.
    pub fn status_doc_id(&self) -> String {
        format!("{}-{}-{}", self.parliament, self.session, self.code)
    }
}

impl fmt::Display for BillKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.parliament, self.session, self.code)
    }
}

/// One entry from the registry's bill listing. `latest_activity` is kept as
/// the raw string the registry served; parsing (and the unparseable-timestamp
/// fallback) is the change detector's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillSummary {
    #[serde(flatten)]
    pub key: BillKey,
    pub latest_activity: Option<String>,
}

/// A completed procedural stage as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInfo {
    pub stage_id: String,
    pub name: String,
    pub chamber: Option<String>,
    pub completed_at: Option<NaiveDate>,
}

/// Structured detail record for a single bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillDetail {
    #[serde(flatten)]
    pub key: BillKey,
    pub title: String,
    pub short_title: Option<String>,
    pub sponsor: Option<String>,
    pub departments: Vec<String>,
    pub latest_major_stage: Option<StageInfo>,
    pub latest_stage: Option<StageInfo>,
    pub full_text_url: Option<String>,
}

/// One registry fetch result at a point in time. Snapshots are superseded by
/// newer ones, never deleted; the raw body lives in the snapshot archive,
/// addressed by `body_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBillSnapshot {
    pub summary: BillSummary,
    pub fetched_at: DateTime<Utc>,
    pub body_hash: Option<String>,
}

/// A stage the pipeline should materialize as a new evidence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage_id: String,
    pub name: String,
    pub chamber: Option<String>,
    pub completed_at: Option<NaiveDate>,
    pub terminal: bool,
}

/// Processing marker kept on per-bill status documents so an interrupted run
/// is resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processed,
}

/// Per-bill bookkeeping document: last activity the pipeline has seen and
/// whether the bill finished its last pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillStatus {
    pub bill_key: String,
    pub latest_activity: Option<String>,
    pub status: ProcessingStatus,
    pub updated_at: DateTime<Utc>,
}

/// Canonical unit of matchable government activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Deterministic identifier; see [`evidence_id_for_bill_stage`] and
    /// [`evidence_id_for_dated_item`].
    pub id: String,
    pub source: SourceType,
    pub title: String,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub url: Option<String>,
    /// Standardized department tags, resolved before scoring.
    pub departments: Vec<String>,
    pub promise_ids: BTreeSet<String>,
    /// Set only for bill-stage evidence.
    pub bill_key: Option<String>,
    pub stage_id: Option<String>,
    /// True only for stages representing final disposition.
    pub terminal_stage: bool,
    pub created_at: DateTime<Utc>,
}

/// A tracked political commitment. Created by separate ingestion; this
/// subsystem only ever touches `evidence_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromiseRecord {
    pub id: String,
    pub text: String,
    pub parties: Vec<String>,
    pub departments: Vec<String>,
    pub keywords: BTreeSet<String>,
    pub evidence_ids: BTreeSet<String>,
}

/// Linking tier a composite score lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    AutoLink,
    NeedsValidation,
    Reject,
}

/// Per-signal contributions behind one (evidence, promise) composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    pub jaccard: f64,
    pub important_term_boost: f64,
    pub department_boost: f64,
    pub concept_boost: f64,
    pub matched_terms: Vec<String>,
    pub matched_departments: Vec<String>,
    pub matched_concepts: Vec<String>,
}

impl ScoreBreakdown {
    /// Weighted sum of all signals, clamped to 1.0.
    pub fn composite(&self) -> f64 {
        let sum =
            self.jaccard + self.important_term_boost + self.department_boost + self.concept_boost;
        sum.min(1.0)
    }
}

/// Outcome counters for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: SourceType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub dry_run: bool,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic evidence identifier for a (bill, completed stage) pair.
/// Re-observing the same stage always derives the same id, which is what
/// makes stage materialization idempotent.
pub fn evidence_id_for_bill_stage(key: &BillKey, stage_id: &str) -> String {
    let source = format!("bill:{key}:stage:{stage_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes()).to_string()
}

/// Deterministic evidence identifier for dated non-bill items (news,
/// regulatory notices): source tag + publication date + content hash of
/// title and URL.
pub fn evidence_id_for_dated_item(
    source: SourceType,
    date: NaiveDate,
    title: &str,
    url: &str,
) -> String {
    let content_hash = sha256_hex(format!("{title}\n{url}").as_bytes());
    let input = format!("{source}:{date}:{content_hash}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, input.as_bytes()).to_string()
}
