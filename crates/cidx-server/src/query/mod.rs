//! The Query Engine: single- and multi-repo dispatch, hybrid fusion,
//! aggregation, payload shaping, and cache-handle issuance.
//!
//! Resolves targets, runs each independently, then merges: generalized
//! from a single-store dispatcher into fan-out across N repos with
//! independent timeouts and partial failure tolerated per branch.

pub mod cache;
pub mod git_explorer;
pub mod regex_search;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cidx_core::embedding::EmbeddingProvider;
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::model::{CorrelationId, GLOBAL_SUFFIX};
use cidx_core::search::{
    self, AggregationMode, ResponseFormat, SearchMode, SearchTiming,
};
use cidx_core::store::{Accuracy, FtsHit, ScipQueryKind, SearchFilters, TemporalHit, VectorHit};
use uuid::Uuid;

use crate::access::EffectiveIdentity;
use crate::repo::RepoManager;
use crate::store::StoreRegistry;

/// Per-repo fan-out timeout.
const PER_REPO_TIMEOUT: Duration = Duration::from_secs(30);

/// How the caller named the repositories to search.
#[derive(Debug, Clone)]
pub enum RepoSelector {
    Single(String),
    List(Vec<String>),
    /// `*-global` or similar: expanded against the registry at query
    /// time, excluding the meta repo unless it is also explicitly
    /// listed.
    Wildcard(String),
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_text: String,
    pub repos: RepoSelector,
    pub mode: SearchMode,
    pub filters: SearchFilters,
    pub limit: usize,
    pub aggregation: AggregationMode,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResultItem {
    pub repo_alias: String,
    pub id: Uuid,
    pub score: f32,
    pub file_path: String,
    pub chunk_offset: u64,
    pub language: Option<String>,
    pub content: Option<String>,
    pub cache_handle: Option<cidx_core::model::CacheHandle>,
    pub evolution: Vec<TemporalHit>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub flat: Vec<SearchResultItem>,
    pub grouped: HashMap<String, Vec<SearchResultItem>>,
    pub errors: Vec<(String, String)>,
    pub timing: Option<SearchTiming>,
}

/// Above this token count, a hit's full content is cached behind a
/// handle instead of inlined.
const CONTENT_TOKEN_THRESHOLD: usize = 2_000;
const CACHE_PAGE_TOKENS: usize = 500;

pub struct QueryEngine {
    stores: Arc<StoreRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    repos: Arc<RepoManager>,
    pub cache: cache::CacheStore,
}

impl QueryEngine {
    pub fn new(stores: Arc<StoreRegistry>, embedder: Arc<dyn EmbeddingProvider>, repos: Arc<RepoManager>) -> Self {
        Self {
            stores,
            embedder,
            repos,
            cache: cache::CacheStore::new(),
        }
    }

    /// Expands a [`RepoSelector`] into concrete aliases, filtered to
    /// what `identity`'s group may access.
    async fn resolve_aliases(&self, selector: &RepoSelector, identity: &EffectiveIdentity) -> CidxResult<Vec<String>> {
        let aliases = match selector {
            RepoSelector::Single(alias) => vec![alias.clone()],
            RepoSelector::List(list) => list.clone(),
            RepoSelector::Wildcard(pattern) => {
                let all = self.repos.list_repositories().await?;
                let glob = globset::Glob::new(pattern)
                    .map_err(|e| CidxError::InvalidInput(format!("bad repo pattern: {e}")))?
                    .compile_matcher();
                all.into_iter()
                    .filter(|r| r.participates_in_wildcard())
                    .filter(|r| glob.is_match(&r.public_alias))
                    .map(|r| r.public_alias)
                    .collect()
            }
        };
        let accessible: Vec<String> = aliases
            .into_iter()
            .filter(|alias| identity.group.can_access_repo(alias))
            .collect();
        if accessible.is_empty() {
            return Err(CidxError::PermissionDenied(
                "no accessible repository matched the request".to_string(),
            ));
        }
        Ok(accessible)
    }

    pub async fn search(
        &self,
        request: SearchRequest,
        identity: &EffectiveIdentity,
        session_id: Uuid,
        _correlation_id: &CorrelationId,
    ) -> CidxResult<SearchResponse> {
        let aliases = self.resolve_aliases(&request.repos, identity).await?;
        let parallel_start = Instant::now();

        let mut branch_ms = Vec::with_capacity(aliases.len());
        let mut per_repo_hits: Vec<(String, Vec<VectorHit>)> = Vec::new();
        let mut errors = Vec::new();

        let mut tasks = Vec::with_capacity(aliases.len());
        for alias in &aliases {
            let alias = alias.clone();
            let request = request.clone();
            let this = self.clone_handles();
            tasks.push(tokio::spawn(async move {
                let start = Instant::now();
                let result = tokio::time::timeout(PER_REPO_TIMEOUT, this.search_one_repo(&alias, &request)).await;
                let elapsed = start.elapsed().as_millis() as u64;
                let outcome = match result {
                    Ok(inner) => inner,
                    Err(_) => Err(CidxError::Timeout(format!("repository '{alias}' search timed out"))),
                };
                (alias, elapsed, outcome)
            }));
        }

        for task in tasks {
            let (alias, elapsed, outcome) = task
                .await
                .map_err(|e| CidxError::Internal(format!("search task panicked: {e}")))?;
            branch_ms.push((alias.clone(), elapsed));
            match outcome {
                Ok(hits) => per_repo_hits.push((alias, hits)),
                Err(e) => errors.push((alias, e.to_string())),
            }
        }

        let parallel_ms = parallel_start.elapsed().as_millis() as u64;
        let merge_start = Instant::now();

        let aggregated = match request.aggregation {
            AggregationMode::Global => search::aggregate_global(per_repo_hits.clone(), request.limit),
            AggregationMode::PerRepo => search::aggregate_per_repo(per_repo_hits.clone(), request.limit),
        };
        let by_repo: HashMap<Uuid, String> = per_repo_hits
            .iter()
            .flat_map(|(alias, hits)| hits.iter().map(move |h| (h.id, alias.clone())))
            .collect();

        let mut flat = Vec::with_capacity(aggregated.len());
        for hit in aggregated {
            let repo_alias = by_repo.get(&hit.id).cloned().unwrap_or_default();
            let evolution = if request.filters.show_evolution {
                self.evolution_for(&repo_alias, &hit, request.filters.evolution_limit).await
            } else {
                Vec::new()
            };
            flat.push(self.shape_payload(repo_alias, hit, session_id, evolution));
        }

        let merge_ms = merge_start.elapsed().as_millis() as u64;
        let timing = SearchTiming::new(branch_ms, parallel_ms, merge_ms);

        let grouped = if matches!(request.response_format, ResponseFormat::Grouped) {
            let mut map: HashMap<String, Vec<SearchResultItem>> = HashMap::new();
            for item in &flat {
                map.entry(item.repo_alias.clone()).or_default().push(item.clone());
            }
            map
        } else {
            HashMap::new()
        };

        Ok(SearchResponse {
            flat,
            grouped,
            errors,
            timing: Some(timing),
        })
    }

    /// Cheap clone of the handles this engine needs inside a spawned
    /// task, without cloning the cache (each repo branch only reads
    /// stores, never the session cache).
    fn clone_handles(&self) -> RepoSearchHandles {
        RepoSearchHandles {
            stores: self.stores.clone(),
            embedder: self.embedder.clone(),
        }
    }

    fn shape_payload(&self, repo_alias: String, hit: VectorHit, session_id: Uuid, evolution: Vec<TemporalHit>) -> SearchResultItem {
        let (content, cache_handle) = match hit.content {
            Some(text) if text.len() / 4 > CONTENT_TOKEN_THRESHOLD => {
                let handle = self.cache.store(session_id, text, CACHE_PAGE_TOKENS);
                (None, Some(handle))
            }
            other => (other, None),
        };
        SearchResultItem {
            repo_alias,
            id: hit.id,
            score: hit.score,
            file_path: hit.file_path,
            chunk_offset: hit.chunk_offset,
            language: hit.language,
            content,
            cache_handle,
            evolution,
        }
    }

    /// Decorates a hit with its commit history when a caller asked for
    /// it; a repo without a temporal index (not git-backed, or not yet
    /// built) just yields no evolution rather than failing the search.
    async fn evolution_for(&self, repo_alias: &str, hit: &VectorHit, evolution_limit: u32) -> Vec<TemporalHit> {
        let Ok(temporal) = self.stores.require_temporal(repo_alias) else {
            return Vec::new();
        };
        temporal
            .evolution(&hit.file_path, hit.chunk_offset, evolution_limit)
            .await
            .unwrap_or_default()
    }

    /// Pages through a previously cached oversized result.
    pub fn get_cached_content(&self, handle: cidx_core::model::CacheHandle, session_id: Uuid, page: usize) -> CidxResult<cache::CachePage> {
        self.cache.get_page(handle, session_id, page)
    }

    /// SCIP navigation tools: definition/references/dependencies
    /// /dependents/impact/callchain/context.
    pub async fn scip_query(
        &self,
        repo_alias: &str,
        kind: ScipQueryKind,
        symbol_or_position: &str,
        exact: bool,
        limit: usize,
    ) -> CidxResult<Vec<cidx_core::store::ScipRecord>> {
        let scip = self.stores.require_scip(repo_alias)?;
        scip.query(kind, symbol_or_position, exact, limit).await
    }

    pub async fn fts_search(&self, repo_alias: &str, query_text: &str, filters: &SearchFilters, limit: usize) -> CidxResult<Vec<FtsHit>> {
        let fts = self.stores.require_fts(repo_alias)?;
        fts.search(query_text, filters, limit).await
    }

    pub async fn temporal_query(&self, repo_alias: &str, filters: &SearchFilters, limit: usize) -> CidxResult<Vec<TemporalHit>> {
        let temporal = self.stores.require_temporal(repo_alias)?;
        temporal.query(filters, limit).await
    }
}

/// The subset of [`QueryEngine`] state a spawned per-repo search task
/// needs — kept separate so the fan-out loop doesn't have to clone the
/// session cache into every task.
#[derive(Clone)]
struct RepoSearchHandles {
    stores: Arc<StoreRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl RepoSearchHandles {
    async fn search_one_repo(&self, alias: &str, request: &SearchRequest) -> CidxResult<Vec<VectorHit>> {
        match request.mode {
            SearchMode::Semantic => {
                let store = self.stores.require_vector(alias)?;
                store
                    .search(&request.query_text, self.embedder.as_ref(), &request.filters, request.limit)
                    .await
            }
            SearchMode::Fts => {
                let fts = self.stores.require_fts(alias)?;
                let hits = fts.search(&request.query_text, &request.filters, request.limit).await?;
                Ok(hits
                    .into_iter()
                    .map(|h| VectorHit {
                        id: h.id,
                        score: h.score,
                        file_path: h.file_path,
                        chunk_offset: h.char_offset,
                        language: None,
                        collection: cidx_core::model::Collection::Code,
                        content: Some(h.snippet),
                    })
                    .collect())
            }
            SearchMode::Hybrid => {
                let store = self.stores.require_vector(alias)?;
                let semantic = store
                    .search(&request.query_text, self.embedder.as_ref(), &request.filters, request.limit)
                    .await?;
                let fts_ids: Vec<Uuid> = match self.stores.require_fts(alias) {
                    Ok(fts) => fts
                        .search(&request.query_text, &request.filters, request.limit)
                        .await?
                        .into_iter()
                        .map(|h| h.id)
                        .collect(),
                    Err(_) => Vec::new(),
                };
                let mut fused = search::fuse_hybrid(&semantic, &fts_ids);
                fused.truncate(request.limit);
                Ok(fused)
            }
        }
    }
}

pub fn accuracy_from_str(s: &str) -> Accuracy {
    match s {
        "fast" => Accuracy::Fast,
        "high" => Accuracy::High,
        _ => Accuracy::Balanced,
    }
}

/// Strips the wildcard repo's suffix for error messages that otherwise
/// read oddly (`*-global` vs `-global`).
pub fn strip_global_suffix(alias: &str) -> &str {
    alias.trim_end_matches(GLOBAL_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_global_suffix_removes_only_the_suffix() {
        assert_eq!(strip_global_suffix("foo-global"), "foo");
        assert_eq!(strip_global_suffix("foo"), "foo");
    }
}
