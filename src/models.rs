//! Core data types used throughout KnowHub.
//!
//! These types represent the documents, chunks, retrieval rows, stream
//! events, and coordination records that flow through the ingestion and
//! generation pipelines.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Whether a document carries running text or a rendered table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Table,
}

/// Position of a chunk within its parent document.
///
/// Markdown sections that get re-split produce composite `{section}-{sub}`
/// indices; everything else uses a flat integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkIndex {
    Flat(usize),
    Section { section: usize, sub: usize },
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkIndex::Flat(i) => write!(f, "{}", i),
            ChunkIndex::Section { section, sub } => write!(f, "{}-{}", section, sub),
        }
    }
}

impl Serialize for ChunkIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ChunkIndex::Flat(i) => serializer.serialize_u64(*i as u64),
            ChunkIndex::Section { .. } => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ChunkIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Number(n) => {
                let i = n
                    .as_u64()
                    .ok_or_else(|| D::Error::custom("chunk_index must be a non-negative integer"))?;
                Ok(ChunkIndex::Flat(i as usize))
            }
            serde_json::Value::String(s) => {
                let (section, sub) = s.split_once('-').ok_or_else(|| {
                    D::Error::custom("composite chunk_index must be {section}-{sub}")
                })?;
                Ok(ChunkIndex::Section {
                    section: section.parse().map_err(D::Error::custom)?,
                    sub: sub.parse().map_err(D::Error::custom)?,
                })
            }
            _ => Err(D::Error::custom("chunk_index must be an integer or a string")),
        }
    }
}

/// Document metadata: a single record with the recognized keys typed out and
/// an open `extensions` map for loader-specific fields (table accuracy,
/// header trails, row counts).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocMetadata {
    /// Full path of the originating file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_sha256: Option<String>,
    /// 1-based page number for paginated formats.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Lowercased suffix including the dot (`".pdf"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<ChunkIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub splitter_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skillsets: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// A parsed unit of text with metadata, the currency of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub page_content: String,
    pub metadata: DocMetadata,
}

impl Document {
    pub fn new(page_content: impl Into<String>, metadata: DocMetadata) -> Self {
        Self {
            page_content: page_content.into(),
            metadata,
        }
    }
}

/// A chunk ready for storage: normalized text, metadata, and its embedding.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub text: String,
    pub metadata: DocMetadata,
    pub embedding: Vec<f32>,
}

/// A row returned by ANN retrieval, ordered by ascending distance.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub id: i64,
    pub text: String,
    pub source: String,
    pub page: i32,
    pub skillsets: Option<Vec<String>>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub distance: f64,
}

/// A row returned by full-text retrieval, ordered by descending rank.
#[derive(Debug, Clone, Serialize)]
pub struct FtsChunk {
    pub id: i64,
    pub text: String,
    pub source: String,
    pub page: i32,
    pub title: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub fts_rank: f64,
}

/// A fused row produced by Reciprocal Rank Fusion over the vector and
/// full-text result lists. The rank fields are 1-based positions in the
/// originating lists; a side that did not return the row contributes `None`.
#[derive(Debug, Clone, Serialize)]
pub struct HybridChunk {
    pub id: i64,
    pub text: String,
    pub source: String,
    pub page: i32,
    pub title: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub vector_rank: Option<u32>,
    pub fts_rank: Option<u32>,
    pub rrf_score: f64,
}

/// Event types on a per-job stream log. Each log receives at most one
/// terminal event (`done` xor `error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventType {
    Token,
    Done,
    Error,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventType::Token => "token",
            StreamEventType::Done => "done",
            StreamEventType::Error => "error",
        }
    }
}

impl fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted audit artifact for a completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub answer: String,
    pub collection: String,
    pub sources: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Lifecycle of an upload coordination record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Presigned,
    Promoted,
    Indexed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Presigned => "presigned",
            UploadStatus::Promoted => "promoted",
            UploadStatus::Indexed => "indexed",
            UploadStatus::Failed => "failed",
        }
    }
}

/// Ephemeral coordination record created at presign time, stored as a Redis
/// hash under `upload:{doc_id}` with a TTL of `expires_in + 120` seconds.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub doc_id: String,
    pub s3_key: String,
    pub filename: String,
    pub status: UploadStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

impl UploadRecord {
    /// Field pairs for HSET.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("doc_id", self.doc_id.clone()),
            ("s3_key", self.s3_key.clone()),
            ("filename", self.filename.clone()),
            ("status", self.status.as_str().to_string()),
            ("created_at", self.created_at.to_string()),
            ("expires_at", self.expires_at.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_index_display() {
        assert_eq!(ChunkIndex::Flat(3).to_string(), "3");
        assert_eq!(
            ChunkIndex::Section { section: 2, sub: 1 }.to_string(),
            "2-1"
        );
    }

    #[test]
    fn chunk_index_serde_round_trip() {
        let flat = serde_json::to_value(ChunkIndex::Flat(7)).unwrap();
        assert_eq!(flat, serde_json::json!(7));
        let composite = serde_json::to_value(ChunkIndex::Section { section: 4, sub: 2 }).unwrap();
        assert_eq!(composite, serde_json::json!("4-2"));

        let back: ChunkIndex = serde_json::from_value(serde_json::json!("4-2")).unwrap();
        assert_eq!(back, ChunkIndex::Section { section: 4, sub: 2 });
        let back: ChunkIndex = serde_json::from_value(serde_json::json!(7)).unwrap();
        assert_eq!(back, ChunkIndex::Flat(7));
    }

    #[test]
    fn content_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ContentType::Table).unwrap(),
            serde_json::json!("table")
        );
    }

    #[test]
    fn upload_record_pairs_cover_all_fields() {
        let record = UploadRecord {
            doc_id: "d".into(),
            s3_key: "uploads/d/a.pdf".into(),
            filename: "a.pdf".into(),
            status: UploadStatus::Presigned,
            created_at: 100,
            expires_at: 700,
        };
        let pairs = record.to_pairs();
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().any(|(k, v)| *k == "status" && v == "presigned"));
    }
}
