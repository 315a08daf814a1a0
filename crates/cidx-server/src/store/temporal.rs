//! Per-repo `TemporalIndex`: commit-history queries and evolution
//! decoration over `git2`'s revwalk.
//!
//! Walks commits and pulls author/timestamp/diff stats out of each
//! `git2::Commit`, filtered by time range / author / diff type and
//! attached to the file region a query asks about.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::store::{SearchFilters, TemporalHit, TemporalIndex};
use git2::Repository;

pub struct GitTemporalIndex {
    repo_path: PathBuf,
}

impl GitTemporalIndex {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    fn open(&self) -> CidxResult<Repository> {
        Repository::open(&self.repo_path)
            .map_err(|e| CidxError::ExternalFailure(format!("failed to open git repo: {e}")))
    }
}

fn commit_time(commit: &git2::Commit) -> DateTime<Utc> {
    Utc.timestamp_opt(commit.time().seconds(), 0).single().unwrap_or_else(Utc::now)
}

fn diff_type_for(commit: &git2::Commit) -> &'static str {
    if commit.parent_count() > 1 {
        "merge"
    } else if commit.parent_count() == 0 {
        "initial"
    } else {
        "modify"
    }
}

#[async_trait]
impl TemporalIndex for GitTemporalIndex {
    async fn query(&self, filters: &SearchFilters, limit: usize) -> CidxResult<Vec<TemporalHit>> {
        let repo_path = self.repo_path.clone();
        let filters = filters.clone();
        tokio::task::spawn_blocking(move || query_blocking(&repo_path, &filters, limit))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    async fn evolution(
        &self,
        file_path: &str,
        _chunk_offset: u64,
        limit: u32,
    ) -> CidxResult<Vec<TemporalHit>> {
        let repo_path = self.repo_path.clone();
        let file_path = file_path.to_string();
        tokio::task::spawn_blocking(move || evolution_blocking(&repo_path, &file_path, limit))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }
}

fn query_blocking(repo_path: &PathBuf, filters: &SearchFilters, limit: usize) -> CidxResult<Vec<TemporalHit>> {
    let repo = Repository::open(repo_path)
        .map_err(|e| CidxError::ExternalFailure(format!("failed to open git repo: {e}")))?;
    let mut revwalk = repo.revwalk().map_err(|e| CidxError::Internal(e.to_string()))?;
    revwalk.push_head().map_err(|e| CidxError::Internal(e.to_string()))?;
    revwalk
        .set_sorting(git2::Sort::TIME)
        .map_err(|e| CidxError::Internal(e.to_string()))?;

    let mut hits = Vec::new();
    for oid in revwalk {
        if hits.len() >= limit {
            break;
        }
        let oid = oid.map_err(|e| CidxError::Internal(e.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|e| CidxError::Internal(e.to_string()))?;
        let when = commit_time(&commit);

        if let Some((from, to)) = filters.time_range {
            if when < from || when > to {
                continue;
            }
        }
        let author = commit.author().name().unwrap_or("unknown").to_string();
        if let Some(filter_author) = &filters.author {
            if &author != filter_author {
                continue;
            }
        }
        let diff_type = diff_type_for(&commit);
        if let Some(filter_diff) = &filters.diff_type {
            if filter_diff != diff_type {
                continue;
            }
        }

        hits.push(TemporalHit {
            commit_sha: commit.id().to_string(),
            author,
            committed_at: when,
            diff_type: diff_type.to_string(),
            file_path: String::new(),
            chunk_type: filters.chunk_type.clone(),
        });
    }
    Ok(hits)
}

fn evolution_blocking(repo_path: &PathBuf, file_path: &str, limit: u32) -> CidxResult<Vec<TemporalHit>> {
    let repo = Repository::open(repo_path)
        .map_err(|e| CidxError::ExternalFailure(format!("failed to open git repo: {e}")))?;
    let mut revwalk = repo.revwalk().map_err(|e| CidxError::Internal(e.to_string()))?;
    revwalk.push_head().map_err(|e| CidxError::Internal(e.to_string()))?;
    revwalk
        .set_sorting(git2::Sort::TIME)
        .map_err(|e| CidxError::Internal(e.to_string()))?;

    let mut hits = Vec::new();
    let mut previous_tree = None;
    for oid in revwalk {
        if hits.len() >= limit as usize {
            break;
        }
        let oid = oid.map_err(|e| CidxError::Internal(e.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|e| CidxError::Internal(e.to_string()))?;
        let tree = commit.tree().map_err(|e| CidxError::Internal(e.to_string()))?;

        let touched = match &previous_tree {
            None => true,
            Some(prev) => {
                let diff = repo
                    .diff_tree_to_tree(Some(&tree), Some(prev), None)
                    .map_err(|e| CidxError::Internal(e.to_string()))?;
                diff.deltas()
                    .any(|d| d.new_file().path().map(|p| p.to_string_lossy() == file_path).unwrap_or(false))
            }
        };
        previous_tree = Some(tree);

        if touched {
            hits.push(TemporalHit {
                commit_sha: commit.id().to_string(),
                author: commit.author().name().unwrap_or("unknown").to_string(),
                committed_at: commit_time(&commit),
                diff_type: diff_type_for(&commit).to_string(),
                file_path: file_path.to_string(),
                chunk_type: None,
            });
        }
    }
    Ok(hits)
}
