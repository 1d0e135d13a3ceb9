//! Bill-registry client, per-source evidence normalization, and the
//! relevance-validator boundary.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use plet_core::{
    evidence_id_for_bill_stage, evidence_id_for_dated_item, BillDetail, BillKey, BillSummary,
    EvidenceRecord, ScoreBreakdown, SourceType, StageEvent,
};
use plet_store::{FetchError, HttpFetcher};
use scraper::Html;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "plet-adapters";

/// Source tag used for the registry's per-source rate limiting and snapshot
/// archive paths.
pub const REGISTRY_SOURCE_TAG: &str = "bill-registry";

/// Source tag for the relevance-validation service.
pub const VALIDATOR_SOURCE_TAG: &str = "relevance-validator";

// ---------------------------------------------------------------------------
// Bill registry client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct BillListResponse {
    bills: Vec<BillSummary>,
}

/// A registry fetch that succeeded, with the raw body retained so the caller
/// can archive the snapshot.
#[derive(Debug, Clone)]
pub struct RegistryDetail {
    pub detail: BillDetail,
    pub raw_body: Vec<u8>,
}

/// Where bill activity comes from. The HTTP registry is the production
/// implementation; tests run against fixture-backed sources.
#[async_trait]
pub trait BillSource: Send + Sync {
    async fn list_bills(
        &self,
        run_id: Uuid,
        session: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<BillSummary>, RegistryError>;

    /// `None` when the source has no detail record for the bill.
    async fn get_bill_detail(
        &self,
        run_id: Uuid,
        key: &BillKey,
    ) -> Result<Option<RegistryDetail>, RegistryError>;

    /// Plain-text full text of the bill, `None` when unavailable.
    async fn get_full_text(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<Option<String>, RegistryError>;
}

/// HTTP client for the external bill registry. Pure I/O: listing, per-bill
/// detail, optional full text. 404 on detail or full text means "not
/// available", never an error.
pub struct BillRegistry {
    base_url: String,
    fetcher: Arc<HttpFetcher>,
}

impl BillRegistry {
    pub fn new(base_url: impl Into<String>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
        }
    }
}

#[async_trait]
impl BillSource for BillRegistry {
    async fn list_bills(
        &self,
        run_id: Uuid,
        session: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<BillSummary>, RegistryError> {
        let url = match session {
            Some(session) => format!("{}/bills?session={session}", self.base_url),
            None => format!("{}/bills", self.base_url),
        };
        let response = self
            .fetcher
            .get_bytes(run_id, REGISTRY_SOURCE_TAG, &url)
            .await?;
        let parsed: BillListResponse =
            serde_json::from_slice(&response.body).map_err(|source| RegistryError::Decode {
                url: response.final_url,
                source,
            })?;
        let mut bills = parsed.bills;
        if let Some(limit) = limit {
            bills.truncate(limit);
        }
        Ok(bills)
    }

    /// Fetch the structured detail record for one bill. `None` when the
    /// registry has no detail (HTTP 404).
    async fn get_bill_detail(
        &self,
        run_id: Uuid,
        key: &BillKey,
    ) -> Result<Option<RegistryDetail>, RegistryError> {
        let url = format!(
            "{}/bills/{}/{}/{}",
            self.base_url, key.parliament, key.session, key.code
        );
        let response = match self.fetcher.get_bytes(run_id, REGISTRY_SOURCE_TAG, &url).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let detail: BillDetail =
            serde_json::from_slice(&response.body).map_err(|source| RegistryError::Decode {
                url: response.final_url,
                source,
            })?;
        Ok(Some(RegistryDetail {
            detail,
            raw_body: response.body,
        }))
    }

    /// Fetch and tag-strip a bill's full-text document. `None` on 404.
    async fn get_full_text(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<Option<String>, RegistryError> {
        let response = match self.fetcher.get_bytes(run_id, REGISTRY_SOURCE_TAG, url).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let html = String::from_utf8_lossy(&response.body);
        Ok(Some(html_to_text(&html)))
    }
}

/// Fixture-backed bill source: a canned listing plus per-bill detail
/// records, loaded from JSON files or built in code by tests.
#[derive(Debug, Default)]
pub struct FixtureBillSource {
    listing: Vec<BillSummary>,
    details: std::collections::HashMap<String, BillDetail>,
    full_texts: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FixtureDetailsFile {
    details: Vec<BillDetail>,
}

impl FixtureBillSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `listing.json` and `details.json` from a fixture directory.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let listing: BillListResponse = read_json_file(dir.join("listing.json"))?;
        let details: FixtureDetailsFile = read_json_file(dir.join("details.json"))?;
        let mut source = Self::new();
        source.listing = listing.bills;
        for detail in details.details {
            source.details.insert(detail.key.status_doc_id(), detail);
        }
        Ok(source)
    }

    pub fn push_bill(&mut self, summary: BillSummary, detail: Option<BillDetail>) {
        if let Some(detail) = detail {
            self.details.insert(detail.key.status_doc_id(), detail);
        }
        self.listing.push(summary);
    }

    pub fn set_full_text(&mut self, url: impl Into<String>, text: impl Into<String>) {
        self.full_texts.insert(url.into(), text.into());
    }
}

#[async_trait]
impl BillSource for FixtureBillSource {
    async fn list_bills(
        &self,
        _run_id: Uuid,
        session: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<BillSummary>, RegistryError> {
        let mut bills: Vec<BillSummary> = self
            .listing
            .iter()
            .filter(|bill| session.map(|s| bill.key.session == s).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            bills.truncate(limit);
        }
        Ok(bills)
    }

    async fn get_bill_detail(
        &self,
        _run_id: Uuid,
        key: &BillKey,
    ) -> Result<Option<RegistryDetail>, RegistryError> {
        Ok(self.details.get(&key.status_doc_id()).map(|detail| {
            RegistryDetail {
                raw_body: serde_json::to_vec(detail).unwrap_or_default(),
                detail: detail.clone(),
            }
        }))
    }

    async fn get_full_text(
        &self,
        _run_id: Uuid,
        url: &str,
    ) -> Result<Option<String>, RegistryError> {
        Ok(self.full_texts.get(url).cloned())
    }
}

/// Reduce an HTML document to whitespace-normalized plain text for keyword
/// extraction.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .root_element()
        .text()
        .flat_map(|chunk| chunk.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Evidence normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload for {source} is missing a parseable date at {pointer}")]
    MissingDate {
        source: SourceType,
        pointer: &'static str,
    },
    #[error("payload for {source} is not a JSON object")]
    NotAnObject { source: SourceType },
}

/// JSON-pointer field table for one source type. Adding a source type is a
/// table addition, not a new code path.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub title: &'static str,
    /// Optional context prepended to the title, e.g. a bill code.
    pub title_context: Option<&'static str>,
    pub date: &'static str,
    pub departments: Option<&'static str>,
    pub body: Option<&'static str>,
    pub url: Option<&'static str>,
}

impl FieldMap {
    pub fn for_source(source: SourceType) -> FieldMap {
        match source {
            SourceType::BillStage => FieldMap {
                title: "/stage_name",
                title_context: Some("/code"),
                date: "/completed_at",
                departments: Some("/departments"),
                body: Some("/bill_title"),
                url: None,
            },
            SourceType::News => FieldMap {
                title: "/headline",
                title_context: None,
                date: "/published_at",
                departments: Some("/department"),
                body: Some("/summary"),
                url: Some("/link"),
            },
            SourceType::RegulatoryNotice => FieldMap {
                title: "/title",
                title_context: None,
                date: "/publication_date",
                departments: Some("/department"),
                body: Some("/text"),
                url: Some("/url"),
            },
        }
    }
}

/// Normalized evidence before department standardization. `raw_departments`
/// carries source-spelled names; the pipeline resolves them to canonical
/// tags before any scoring happens.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceDraft {
    pub id: String,
    pub source: SourceType,
    pub title: String,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub url: Option<String>,
    pub raw_departments: Vec<String>,
    pub bill_key: Option<String>,
    pub stage_id: Option<String>,
    pub terminal_stage: bool,
}

impl EvidenceDraft {
    /// Finish the draft into a persistable record once departments are
    /// standardized.
    pub fn into_record(self, departments: Vec<String>, now: DateTime<Utc>) -> EvidenceRecord {
        EvidenceRecord {
            id: self.id,
            source: self.source,
            title: self.title,
            description: self.description,
            date: self.date,
            url: self.url,
            departments,
            promise_ids: Default::default(),
            bill_key: self.bill_key,
            stage_id: self.stage_id,
            terminal_stage: self.terminal_stage,
            created_at: now,
        }
    }
}

fn pointer_str<'a>(payload: &'a JsonValue, pointer: &str) -> Option<&'a str> {
    payload.pointer(pointer).and_then(JsonValue::as_str)
}

fn pointer_trimmed(payload: &JsonValue, pointer: &str) -> Option<String> {
    pointer_str(payload, pointer).and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Department fields arrive as either a single string or an array of
/// strings; anything else maps to the empty set.
fn pointer_string_list(payload: &JsonValue, pointer: &str) -> Vec<String> {
    match payload.pointer(pointer) {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_payload_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.date_naive())
}

/// Pure mapping from (source type, raw payload) to an evidence draft.
///
/// Missing or unknown fields map to `None`, never to a panic. The one hard
/// requirement is a parseable date on dated (non-bill) sources, because the
/// deterministic identifier is derived from it.
pub fn normalize(source: SourceType, payload: &JsonValue) -> Result<EvidenceDraft, NormalizeError> {
    if !payload.is_object() {
        return Err(NormalizeError::NotAnObject { source });
    }
    let map = FieldMap::for_source(source);

    let base_title = pointer_trimmed(payload, map.title);
    let title = match (base_title, map.title_context.and_then(|p| pointer_trimmed(payload, p))) {
        (Some(title), Some(context)) => format!("{context}: {title}"),
        (Some(title), None) => title,
        (None, Some(context)) => context,
        (None, None) => "untitled".to_string(),
    };
    let description = map.body.and_then(|p| pointer_trimmed(payload, p));
    let url = map.url.and_then(|p| pointer_trimmed(payload, p));
    let raw_departments = map
        .departments
        .map(|p| pointer_string_list(payload, p))
        .unwrap_or_default();
    let date = pointer_str(payload, map.date).and_then(parse_payload_date);

    match source {
        SourceType::BillStage => {
            let key = BillKey {
                parliament: payload
                    .pointer("/parliament")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or_default() as u32,
                session: payload
                    .pointer("/session")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or_default() as u32,
                code: pointer_trimmed(payload, "/code").unwrap_or_default(),
            };
            let stage_id = pointer_trimmed(payload, "/stage_id").unwrap_or_default();
            let terminal = payload
                .pointer("/terminal")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            Ok(EvidenceDraft {
                id: evidence_id_for_bill_stage(&key, &stage_id),
                source,
                title,
                description,
                date,
                url,
                raw_departments,
                bill_key: Some(key.status_doc_id()),
                stage_id: Some(stage_id),
                terminal_stage: terminal,
            })
        }
        SourceType::News | SourceType::RegulatoryNotice => {
            let date = date.ok_or(NormalizeError::MissingDate {
                source,
                pointer: map.date,
            })?;
            let id = evidence_id_for_dated_item(
                source,
                date,
                &title,
                url.as_deref().unwrap_or_default(),
            );
            Ok(EvidenceDraft {
                id,
                source,
                title,
                description,
                date: Some(date),
                url,
                raw_departments,
                bill_key: None,
                stage_id: None,
                terminal_stage: false,
            })
        }
    }
}

/// Synthesize the bill-stage payload the normalizer's field table expects
/// from a registry detail record and one extracted stage event.
pub fn bill_stage_payload(
    detail: &BillDetail,
    stage: &StageEvent,
    full_text: Option<&str>,
) -> JsonValue {
    serde_json::json!({
        "parliament": detail.key.parliament,
        "session": detail.key.session,
        "code": detail.key.code,
        "bill_title": detail.title,
        "stage_id": stage.stage_id,
        "stage_name": stage.name,
        "chamber": stage.chamber,
        "completed_at": stage.completed_at.map(|d| d.to_string()),
        "terminal": stage.terminal,
        "departments": detail.departments,
        "full_text": full_text,
    })
}

// ---------------------------------------------------------------------------
// Relevance validator boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    /// The service answered, but not with the agreed response shape. Callers
    /// must degrade this to a reject decision, never to an auto-link.
    #[error("validator response violated the schema: {0}")]
    SchemaViolation(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationRequest {
    pub evidence_text: String,
    pub promise_text: String,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationVerdict {
    pub is_relevant: bool,
    pub rationale: String,
}

#[async_trait]
pub trait RelevanceValidator: Send + Sync {
    async fn judge(
        &self,
        run_id: Uuid,
        request: &ValidationRequest,
    ) -> Result<ValidationVerdict, ValidatorError>;
}

/// HTTP implementation of the relevance boundary: POSTs the pair plus score
/// breakdown, requires a schema-conformant JSON verdict back.
pub struct HttpValidator {
    endpoint: String,
    fetcher: Arc<HttpFetcher>,
}

impl HttpValidator {
    pub fn new(endpoint: impl Into<String>, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            endpoint: endpoint.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl RelevanceValidator for HttpValidator {
    async fn judge(
        &self,
        run_id: Uuid,
        request: &ValidationRequest,
    ) -> Result<ValidationVerdict, ValidatorError> {
        let body = serde_json::to_value(request)
            .map_err(|err| ValidatorError::SchemaViolation(err.to_string()))?;
        let response = self
            .fetcher
            .post_json(run_id, VALIDATOR_SOURCE_TAG, &self.endpoint, &body)
            .await?;
        serde_json::from_slice(&response.body)
            .map_err(|err| ValidatorError::SchemaViolation(err.to_string()))
    }
}

/// Scripted validator for tests: returns canned outcomes in order and logs
/// every request it saw.
#[derive(Default)]
pub struct ScriptedValidator {
    script: std::sync::Mutex<VecDeque<Result<ValidationVerdict, String>>>,
    calls: std::sync::Mutex<Vec<ValidationRequest>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a verdict for the next call.
    pub fn push_verdict(&self, is_relevant: bool, rationale: &str) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Ok(ValidationVerdict {
                is_relevant,
                rationale: rationale.to_string(),
            }));
    }

    /// Queue a schema violation for the next call.
    pub fn push_schema_violation(&self, detail: &str) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Err(detail.to_string()));
    }

    pub fn calls(&self) -> Vec<ValidationRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl RelevanceValidator for ScriptedValidator {
    async fn judge(
        &self,
        _run_id: Uuid,
        request: &ValidationRequest,
    ) -> Result<ValidationVerdict, ValidatorError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.clone());
        match self.script.lock().expect("script lock").pop_front() {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(detail)) => Err(ValidatorError::SchemaViolation(detail)),
            // An unscripted call confirms nothing.
            None => Ok(ValidationVerdict {
                is_relevant: false,
                rationale: "unscripted".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixture loading (golden payloads for adapter tests)
// ---------------------------------------------------------------------------

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
