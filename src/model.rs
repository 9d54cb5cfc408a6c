//! Persistent record types shared by the store, the pipeline stages, and the
//! HTTP surface. Status and type enums are closed sets whose string forms are
//! fixed by the persisted schema and the JSON API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stamped on chunks, vectors, annotations, concepts, and edges so a future
/// pipeline revision can re-derive them side by side.
pub const PIPELINE_VERSION: &str = "v1";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Pending,
    Extracted,
    Chunked,
    Embedded,
    Annotated,
    Error,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Pending => "pending",
            AssetStatus::Extracted => "extracted",
            AssetStatus::Chunked => "chunked",
            AssetStatus::Embedded => "embedded",
            AssetStatus::Annotated => "annotated",
            AssetStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AssetStatus::Pending),
            "extracted" => Some(AssetStatus::Extracted),
            "chunked" => Some(AssetStatus::Chunked),
            "embedded" => Some(AssetStatus::Embedded),
            "annotated" => Some(AssetStatus::Annotated),
            "error" => Some(AssetStatus::Error),
            _ => None,
        }
    }

    /// Every status the API reports, in pipeline order.
    pub const ALL: [AssetStatus; 6] = [
        AssetStatus::Pending,
        AssetStatus::Extracted,
        AssetStatus::Chunked,
        AssetStatus::Embedded,
        AssetStatus::Annotated,
        AssetStatus::Error,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomType {
    Text,
    Image,
    Table,
    Metadata,
    Binary,
}

impl AtomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtomType::Text => "text",
            AtomType::Image => "image",
            AtomType::Table => "table",
            AtomType::Metadata => "metadata",
            AtomType::Binary => "binary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(AtomType::Text),
            "image" => Some(AtomType::Image),
            "table" => Some(AtomType::Table),
            "metadata" => Some(AtomType::Metadata),
            "binary" => Some(AtomType::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    ConceptMember,
    Similarity,
    CoOccurrence,
    ParentChild,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::ConceptMember => "concept_member",
            EdgeType::Similarity => "similarity",
            EdgeType::CoOccurrence => "co_occurrence",
            EdgeType::ParentChild => "parent_child",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "concept_member" => Some(EdgeType::ConceptMember),
            "similarity" => Some(EdgeType::Similarity),
            "co_occurrence" => Some(EdgeType::CoOccurrence),
            "parent_child" => Some(EdgeType::ParentChild),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Evidence anchor
// ---------------------------------------------------------------------------

/// JSON locator pinning an atom or chunk to coordinates inside its source
/// file. Serialized with `None` fields omitted; the serialized form feeds the
/// deterministic chunk ID, so field order and omission rules must not change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceAnchor {
    pub asset_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_chain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_end: Option<usize>,
}

impl EvidenceAnchor {
    pub fn for_asset(asset_id: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"asset_id\":\"{}\"}}", self.asset_id))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One tracked file under a watched root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub path: String,
    pub filename: String,
    pub size_bytes: u64,
    pub mtime_ns: i64,
    pub content_hash: String,
    pub mime_type: String,
    pub scan_version: i64,
    pub status: AssetStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One extracted content fragment belonging to an asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentAtom {
    pub id: String,
    pub asset_id: String,
    pub atom_type: AtomType,
    pub seq: i64,
    pub text: Option<String>,
    /// Path reference for payloads kept on disk (images, binaries).
    pub payload_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub anchor: EvidenceAnchor,
}

/// A token-bounded slice of an atom's text, the unit of embedding and
/// annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub atom_id: String,
    pub asset_id: String,
    pub text: String,
    pub token_count: usize,
    pub chunk_index: i64,
    pub anchor: EvidenceAnchor,
    pub embedding_ref: Option<String>,
    pub pipeline_version: String,
}

/// Denormalized embedding row paired with a chunk by shared ID. Carries
/// enough context for zero-lookup search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub asset_id: String,
    pub asset_path: String,
    pub anchor_json: String,
    pub pipeline_version: String,
}

/// Structured analysis payload the annotator demands from the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnotationPayload {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub sentiment: Sentiment,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub quality_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: String,
    pub confidence: f64,
}

impl Default for Sentiment {
    fn default() -> Self {
        Self {
            label: "neutral".to_string(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claim: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Versioned LLM analysis of a chunk. Never overwritten: a new annotation
/// flips the prior current row to non-current in the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub chunk_id: String,
    pub model_id: String,
    pub prompt_id: String,
    pub prompt_version: String,
    pub pipeline_version: String,
    pub payload: AnnotationPayload,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

/// Labeled cluster of chunks at some level of granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptNode {
    pub id: String,
    pub level: i64,
    pub label: String,
    pub description: String,
    pub parent_id: Option<String>,
    pub exemplar_chunk_ids: Vec<String>,
    pub pipeline_version: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

/// Typed, weighted directed edge between graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub edge_type: EdgeType,
    pub source_id: String,
    pub target_id: String,
    pub weight: f64,
    pub evidence: Option<serde_json::Value>,
    pub pipeline_version: String,
}

/// Crash-recovery record for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub progress: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User-declared source directory scanned for assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedRoot {
    pub id: String,
    pub path: String,
    pub label: String,
    pub added_at: DateTime<Utc>,
    pub last_scan_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in AssetStatus::ALL {
            assert_eq!(AssetStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AssetStatus::parse("bogus"), None);
    }

    #[test]
    fn anchor_omits_empty_fields() {
        let anchor = EvidenceAnchor::for_asset("abc");
        assert_eq!(anchor.to_json(), r#"{"asset_id":"abc"}"#);
    }

    #[test]
    fn anchor_round_trips_through_json() {
        let anchor = EvidenceAnchor {
            asset_id: "a1".into(),
            chapter: Some("ch3".into()),
            archive_chain: Some(vec!["inner/doc.txt".into()]),
            ..Default::default()
        };
        let json = anchor.to_json();
        let back: EvidenceAnchor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, anchor);
    }

    #[test]
    fn annotation_payload_tolerates_missing_fields() {
        let parsed: AnnotationPayload = serde_json::from_str(r#"{"summary":"s"}"#).unwrap();
        assert_eq!(parsed.summary, "s");
        assert!(parsed.topics.is_empty());
        assert_eq!(parsed.sentiment.label, "neutral");
    }
}
