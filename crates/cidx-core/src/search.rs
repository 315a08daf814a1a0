//! The Query Engine's fusion and aggregation algorithms: Reciprocal
//! Rank Fusion for single-repo hybrid search, global/per-repo
//! aggregation for multi-repo fan-out, and dual-model dedup merge.
//!
//! Pure functions over already-fetched candidates, fully unit-testable
//! without a store. Hybrid fusion uses unnormalized Reciprocal Rank
//! Fusion rather than min-max-normalized score blending, since RRF
//! needs no cross-backend score calibration between the vector and FTS
//! result sets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::VectorHit;

/// RRF damping constant: `score(doc) = Σ 1/(k + rank)`.
pub const RRF_K: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    Global,
    PerRepo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Flat,
    Grouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Fts,
    Hybrid,
}

/// Per-branch and aggregate timing, always attached to a response
///. `parallel_ms >= max(branch_ms)` is
/// a tested invariant, enforced by [`SearchTiming::new`] rather than
/// left to callers to get right.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTiming {
    pub branch_ms: Vec<(String, u64)>,
    pub parallel_ms: u64,
    pub merge_ms: u64,
}

impl SearchTiming {
    /// Builds the timing block, clamping `parallel_ms` up to at least
    /// the slowest branch if the caller measured otherwise (clock skew
    /// between tasks should never surface as a violated invariant).
    pub fn new(branch_ms: Vec<(String, u64)>, parallel_ms: u64, merge_ms: u64) -> Self {
        let slowest = branch_ms.iter().map(|(_, ms)| *ms).max().unwrap_or(0);
        Self {
            branch_ms,
            parallel_ms: parallel_ms.max(slowest),
            merge_ms,
        }
    }
}

/// Combines one or more ranked candidate lists for the *same* document
/// space (e.g. a semantic ranking and an FTS ranking over the same repo)
/// into a single RRF score per document. A document absent from a list
/// contributes nothing for that list, per the formula — it is not
/// penalized beyond simply not accumulating a term.
pub fn reciprocal_rank_fusion(rankings: &[Vec<Uuid>], k: f32) -> HashMap<Uuid, f32> {
    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    for ranking in rankings {
        for (rank, id) in ranking.iter().enumerate() {
            // rank is 0-based; the formula's rank is 1-based.
            *scores.entry(*id).or_insert(0.0) += 1.0 / (k + (rank as f32 + 1.0));
        }
    }
    scores
}

/// Fuses a semantic-search hit list and an FTS hit list for a single
/// repo via RRF, returning hits sorted by fused score descending.
/// Documents present in both rankings accumulate both terms and so
/// naturally outrank documents found by only one mode.
pub fn fuse_hybrid(semantic: &[VectorHit], fts_ids: &[Uuid]) -> Vec<VectorHit> {
    let semantic_ranking: Vec<Uuid> = semantic.iter().map(|h| h.id).collect();
    let rankings = [semantic_ranking, fts_ids.to_vec()];
    let scores = reciprocal_rank_fusion(&rankings, RRF_K);

    let mut by_id: HashMap<Uuid, VectorHit> =
        semantic.iter().cloned().map(|h| (h.id, h)).collect();
    for (id, score) in &scores {
        if let Some(hit) = by_id.get_mut(id) {
            hit.score = *score;
        }
    }
    let mut fused: Vec<VectorHit> = by_id.into_values().collect();
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Deduplicates dual-model (code + multimodal) results by
/// `(file_path, chunk_offset)`, keeping the higher-scoring hit per key.
pub fn dedup_dual_model(hits: Vec<VectorHit>) -> Vec<VectorHit> {
    let mut best: HashMap<(String, u64), VectorHit> = HashMap::new();
    for hit in hits {
        let key = (hit.file_path.clone(), hit.chunk_offset);
        match best.get(&key) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }
    let mut merged: Vec<VectorHit> = best.into_values().collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

/// Merges already-ranked per-repo hit lists into one globally sorted
/// list truncated to `limit`.
pub fn aggregate_global(per_repo: Vec<(String, Vec<VectorHit>)>, limit: usize) -> Vec<VectorHit> {
    let mut all: Vec<VectorHit> = per_repo.into_iter().flat_map(|(_, hits)| hits).collect();
    all.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    all.truncate(limit);
    all
}

/// Computes how many results each of `repo_aliases` should contribute so
/// they sum to exactly `limit`, as evenly as possible, with any
/// remainder given to repos earliest in alphabetical order.
pub fn distribute_per_repo(limit: usize, repo_aliases: &[String]) -> HashMap<String, usize> {
    let mut sorted = repo_aliases.to_vec();
    sorted.sort();
    let n = sorted.len();
    if n == 0 {
        return HashMap::new();
    }
    let base = limit / n;
    let remainder = limit % n;
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, alias)| (alias, base + usize::from(i < remainder)))
        .collect()
}

/// Applies the per-repo share computed by [`distribute_per_repo`] to
/// each repo's already-ranked hit list, then concatenates — grouped
/// order (repo, then rank within repo) rather than re-sorted globally,
/// since `per_repo` mode is about fair distribution, not global score
/// order.
pub fn aggregate_per_repo(per_repo: Vec<(String, Vec<VectorHit>)>, limit: usize) -> Vec<VectorHit> {
    let aliases: Vec<String> = per_repo.iter().map(|(alias, _)| alias.clone()).collect();
    let shares = distribute_per_repo(limit, &aliases);

    let mut sorted_repos = per_repo;
    sorted_repos.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    for (alias, hits) in sorted_repos {
        let share = shares.get(&alias).copied().unwrap_or(0);
        out.extend(hits.into_iter().take(share));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Collection;

    fn hit(id: Uuid, score: f32, file: &str, offset: u64) -> VectorHit {
        VectorHit {
            id,
            score,
            file_path: file.to_string(),
            chunk_offset: offset,
            language: None,
            collection: Collection::Code,
            content: None,
        }
    }

    #[test]
    fn rrf_ranks_docs_in_both_lists_highest() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        // a: rank 0 in both lists. b: rank 1 in list1 only. c: rank 0 in list2 only.
        let list1 = vec![a, b];
        let list2 = vec![c, a];
        let scores = reciprocal_rank_fusion(&[list1, list2], RRF_K);
        assert!(scores[&a] > scores[&b]);
        assert!(scores[&a] > scores[&c]);
    }

    #[test]
    fn dedup_dual_model_keeps_max_score() {
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let hits = vec![
            hit(id1, 0.5, "src/a.rs", 0),
            hit(id2, 0.9, "src/a.rs", 0),
            hit(Uuid::new_v4(), 0.3, "src/b.rs", 10),
        ];
        let deduped = dedup_dual_model(hits);
        assert_eq!(deduped.len(), 2);
        let a_entry = deduped.iter().find(|h| h.file_path == "src/a.rs").unwrap();
        assert_eq!(a_entry.score, 0.9);
    }

    #[test]
    fn per_repo_distribution_gives_remainder_to_earliest_alias() {
        let aliases = vec!["a-global".to_string(), "b-global".to_string(), "c-global".to_string()];
        let shares = distribute_per_repo(10, &aliases);
        let mut values: Vec<usize> = shares.values().copied().collect();
        values.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(values, vec![4, 3, 3]);
        assert_eq!(shares["a-global"], 4); // alphabetically first gets the remainder
    }

    #[test]
    fn global_aggregation_sorts_and_truncates() {
        let per_repo = vec![
            ("a-global".to_string(), vec![hit(Uuid::new_v4(), 0.2, "x", 0)]),
            ("b-global".to_string(), vec![hit(Uuid::new_v4(), 0.9, "y", 0)]),
        ];
        let merged = aggregate_global(per_repo, 1);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].score, 0.9);
    }

    #[test]
    fn timing_invariant_parallel_ge_max_branch() {
        let timing = SearchTiming::new(
            vec![("a-global".to_string(), 120), ("b-global".to_string(), 80)],
            50, // caller under-measured; must be clamped up
            5,
        );
        assert!(timing.parallel_ms >= 120);
    }
}
