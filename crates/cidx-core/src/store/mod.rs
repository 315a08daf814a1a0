//! Capability traits for the four index backends a repository may carry,
//! plus the shared query/result types they all speak.
//!
//! Each capability is an `async_trait` over a storage backend,
//! implemented independently per index kind rather than behind one
//! general-purpose storage trait, since vector similarity, token
//! match, time-range, and graph-traversal queries have little shape in
//! common.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::error::CidxResult;
use crate::model::{Collection, VectorRecord};

/// Maps to the ANN `ef_query` parameter: fast=low recall/fast, balanced=default, high=high recall/slow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    Fast,
    Balanced,
    High,
}

impl Default for Accuracy {
    fn default() -> Self {
        Accuracy::Balanced
    }
}

/// The narrowing filters a single-repo search may apply, shared by the
/// vector, FTS, and temporal backends (each backend ignores filters
/// outside its domain).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub language: Option<String>,
    pub exclude_language: Option<String>,
    pub path_filter: Option<String>,
    pub exclude_path: Option<String>,
    pub file_extensions: Option<Vec<String>>,
    pub min_score: Option<f32>,
    pub accuracy: Accuracy,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub at_commit: Option<String>,
    pub include_removed: bool,
    pub show_evolution: bool,
    pub evolution_limit: u32,
    pub case_sensitive: bool,
    pub fuzzy: bool,
    pub edit_distance: Option<u32>,
    pub snippet_lines: u32,
    pub regex: Option<String>,
    pub diff_type: Option<String>,
    pub author: Option<String>,
    pub chunk_type: Option<String>,
}

/// One ranked hit from [`VectorStore::search`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: Uuid,
    pub score: f32,
    pub file_path: String,
    pub chunk_offset: u64,
    pub language: Option<String>,
    pub collection: Collection,
    /// Present unless the caller requested payload-only (oversized
    /// content is instead cached by the Query Engine, not here).
    pub content: Option<String>,
}

/// One ranked hit from [`FtsIndex::search`], carrying Unicode-aware true
/// character offsets and a context-line snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtsHit {
    pub id: Uuid,
    pub score: f32,
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub char_offset: u64,
    pub snippet: String,
}

/// One commit-history entry attached to a hit when `show_evolution` is
/// set, or returned directly by temporal-only queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalHit {
    pub commit_sha: String,
    pub author: String,
    pub committed_at: DateTime<Utc>,
    pub diff_type: String,
    pub file_path: String,
    pub chunk_type: Option<String>,
}

/// A compact SCIP graph record returned by every symbol-navigation tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScipRecord {
    pub symbol: String,
    pub project: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub kind: String,
    pub relationship: Option<String>,
    pub context: Option<String>,
}

/// Which SCIP relationship a navigation query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScipQueryKind {
    Definition,
    References,
    Dependencies,
    Dependents,
    Impact,
    CallChain,
    Context,
}

/// Result of [`VectorStore::integrity`]: the ANN self-check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub checked: u64,
    pub self_loops: u64,
    pub duplicates: u64,
    pub orphans: u64,
    pub notes: Vec<String>,
}

/// Per-repo vector store: HNSW-backed ANN search over a quantized
/// filesystem layout.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, records: Vec<VectorRecord>) -> CidxResult<()>;
    async fn delete(&self, ids: &[Uuid]) -> CidxResult<()>;
    async fn count(&self) -> CidxResult<u64>;

    async fn search(
        &self,
        query_text: &str,
        embedder: &dyn EmbeddingProvider,
        filters: &SearchFilters,
        limit: usize,
    ) -> CidxResult<Vec<VectorHit>>;

    /// 3-tier content fallback: current-file read → git-blob lookup →
    /// `NotFound` with recovery guidance in the message.
    async fn get_content(&self, id: Uuid) -> CidxResult<String>;

    async fn integrity(&self) -> CidxResult<IntegrityReport>;
}

/// Per-repo full-text index: exact boolean-AND token search with
/// optional fuzzy/regex modes.
#[async_trait]
pub trait FtsIndex: Send + Sync {
    async fn upsert(&self, records: Vec<VectorRecord>) -> CidxResult<()>;
    async fn delete(&self, ids: &[Uuid]) -> CidxResult<()>;

    async fn search(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> CidxResult<Vec<FtsHit>>;
}

/// Per-repo temporal/commit-history index.
#[async_trait]
pub trait TemporalIndex: Send + Sync {
    async fn query(&self, filters: &SearchFilters, limit: usize) -> CidxResult<Vec<TemporalHit>>;

    /// Up to `filters.evolution_limit` commits touching the region
    /// identified by `file_path`/`chunk_offset`, newest first.
    async fn evolution(
        &self,
        file_path: &str,
        chunk_offset: u64,
        limit: u32,
    ) -> CidxResult<Vec<TemporalHit>>;
}

/// Per-repo SCIP symbol database.
#[async_trait]
pub trait ScipIndex: Send + Sync {
    async fn query(
        &self,
        kind: ScipQueryKind,
        symbol_or_position: &str,
        exact: bool,
        limit: usize,
    ) -> CidxResult<Vec<ScipRecord>>;
}
