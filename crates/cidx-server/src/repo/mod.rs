//! Repo Manager: golden-repository lifecycle (clone, incremental
//! refresh, index-flag reconciliation) over `git2`, serialized per repo
//! by an advisory lock.
//!
//! `fetch`, `reset --hard`, and `diff` against the last indexed commit
//! drive refresh from a long-running server process rather than a CLI
//! invocation, so each repo's lock must be held for the whole refresh,
//! not just one git call.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::model::{IndexFlags, IndexKind, Job, JobKind, RefreshPolicy, Repository};
use parking_lot::Mutex as SyncMutex;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::jobs::{JobExecutor, JobQueue};

pub mod pipeline;

/// A changed-file set computed between the last-indexed commit and the
/// freshly-fetched HEAD, handed to the index pipeline for incremental
/// upserts/deletes.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added_or_modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// The indexing side of a refresh, implemented by `crate::store` and
/// injected here so the Repo Manager stays free of ANN/FTS/SCIP
/// knowledge — it only knows how to get git state into a shape those
/// backends can consume.
#[async_trait]
pub trait IndexPipeline: Send + Sync {
    async fn apply_changes(&self, alias: &str, changes: &ChangeSet) -> CidxResult<()>;
    async fn rebuild_fts_incremental(&self, alias: &str, changes: &ChangeSet) -> CidxResult<()>;
    async fn generate_and_import_scip(&self, alias: &str, clone_path: &PathBuf) -> CidxResult<()>;
}

pub struct RepoManager {
    pool: SqlitePool,
    data_dir: PathBuf,
    repo_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RepoManager {
    pub fn new(pool: SqlitePool, data_dir: PathBuf) -> Self {
        Self {
            pool,
            data_dir,
            repo_locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, base_name: &str) -> Arc<AsyncMutex<()>> {
        self.repo_locks
            .lock()
            .entry(base_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn get_repository(&self, base_name: &str) -> CidxResult<Repository> {
        let row = sqlx::query_as::<_, RepoRow>(
            "SELECT base_name, public_alias, source_url, default_branch, clone_path, created_at, \
             flags_json, last_refresh, refresh_policy_json FROM repositories WHERE base_name = ? OR public_alias = ?",
        )
        .bind(base_name)
        .bind(base_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        row.ok_or_else(|| CidxError::NotFound(format!("repository '{base_name}' not found")))?
            .into_repository()
    }

    pub async fn list_repositories(&self) -> CidxResult<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepoRow>(
            "SELECT base_name, public_alias, source_url, default_branch, clone_path, created_at, \
             flags_json, last_refresh, refresh_policy_json FROM repositories ORDER BY base_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;
        rows.into_iter().map(RepoRow::into_repository).collect()
    }

    async fn insert_repository(&self, repo: &Repository) -> CidxResult<()> {
        sqlx::query(
            "INSERT INTO repositories (base_name, public_alias, source_url, default_branch, \
             clone_path, created_at, flags_json, last_refresh, refresh_policy_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&repo.base_name)
        .bind(&repo.public_alias)
        .bind(&repo.source_url)
        .bind(&repo.default_branch)
        .bind(repo.clone_path.to_string_lossy().to_string())
        .bind(repo.created_at.to_rfc3339())
        .bind(serde_json::to_string(&repo.flags).map_err(|e| CidxError::Internal(e.to_string()))?)
        .bind(repo.last_refresh.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&repo.refresh_policy).map_err(|e| CidxError::Internal(e.to_string()))?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                CidxError::Conflict(format!("repository '{}' already exists", repo.base_name))
            } else {
                CidxError::Internal(e.to_string())
            }
        })?;
        Ok(())
    }

    /// Clones the repository and records it in the registry. The actual
    /// clone runs synchronously inside `spawn_blocking` since `git2` is
    /// blocking I/O, matching the spec's "any I/O is a suspension point"
    /// rule without blocking the async runtime's worker threads.
    pub async fn perform_add_golden_repo(
        &self,
        base_name: &str,
        source_url: &str,
        branch: &str,
    ) -> CidxResult<()> {
        let clone_path = self.data_dir.join("repos").join(base_name);
        let repo = Repository::new(
            base_name,
            source_url,
            branch,
            clone_path.clone(),
            RefreshPolicy::Manual,
        )?;

        let lock = self.lock_for(base_name);
        let _guard = lock.lock().await;

        let url = source_url.to_string();
        let branch_owned = branch.to_string();
        let path = clone_path.clone();
        tokio::task::spawn_blocking(move || clone_repo(&url, &branch_owned, &path))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
            .map_err(|e| CidxError::ExternalFailure(format!("git clone failed: {e}")))?;

        self.insert_repository(&repo).await?;
        info!(alias = %repo.public_alias, "golden repository added");
        Ok(())
    }

    pub async fn perform_remove_golden_repo(&self, base_name: &str) -> CidxResult<()> {
        let repo = self.get_repository(base_name).await?;
        let lock = self.lock_for(&repo.base_name);
        let _guard = lock.lock().await;

        sqlx::query("DELETE FROM repositories WHERE base_name = ?")
            .bind(&repo.base_name)
            .execute(&self.pool)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;

        let path = repo.clone_path.clone();
        tokio::task::spawn_blocking(move || {
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        Ok(())
    }

    /// Runs the full refresh algorithm: lock,
    /// fetch + hard reset, diff against the last-indexed commit, hand
    /// the change set to the index pipeline, update `last_refresh`.
    /// Any failing step leaves the registry at its last known good
    /// state — the flag set and `last_refresh` are only written on
    /// success.
    pub async fn perform_refresh(
        &self,
        base_name: &str,
        pipeline: &dyn IndexPipeline,
    ) -> CidxResult<ChangeSet> {
        let repo = self.get_repository(base_name).await?;
        let lock = self.lock_for(&repo.base_name);
        let _guard = lock.lock().await;

        let last_commit = self.last_indexed_commit(&repo.base_name).await?;
        let path = repo.clone_path.clone();
        let branch = repo.default_branch.clone();
        let (new_commit, changes) = tokio::task::spawn_blocking(move || {
            fetch_and_reset(&path, &branch)?;
            let changes = diff_against(&path, last_commit.as_deref())?;
            let head = current_head(&path)?;
            Ok::<_, git2::Error>((head, changes))
        })
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?
        .map_err(|e| CidxError::ExternalFailure(format!("git refresh failed: {e}")))?;

        pipeline.apply_changes(&repo.public_alias, &changes).await?;
        if repo.flags.fts {
            pipeline.rebuild_fts_incremental(&repo.public_alias, &changes).await?;
        }
        if repo.flags.scip {
            pipeline
                .generate_and_import_scip(&repo.public_alias, &repo.clone_path)
                .await?;
        }

        sqlx::query(
            "UPDATE repositories SET last_refresh = ?, last_indexed_commit = ? WHERE base_name = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&new_commit)
        .bind(&repo.base_name)
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        Ok(changes)
    }

    async fn last_indexed_commit(&self, base_name: &str) -> CidxResult<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT last_indexed_commit FROM repositories WHERE base_name = ?")
                .bind(base_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(row.and_then(|(c,)| c))
    }

    /// Idempotent: marks `kind` present in the flag set, to be actually
    /// built by a follow-on refresh/index job. Safe to call repeatedly.
    pub async fn mark_index_flag(&self, base_name: &str, kind: IndexKind) -> CidxResult<()> {
        let mut repo = self.get_repository(base_name).await?;
        match kind {
            IndexKind::Semantic => repo.flags.semantic = true,
            IndexKind::Fts => repo.flags.fts = true,
            IndexKind::Temporal => repo.flags.temporal = true,
            IndexKind::Scip => repo.flags.scip = true,
        }
        sqlx::query("UPDATE repositories SET flags_json = ? WHERE base_name = ?")
            .bind(serde_json::to_string(&repo.flags).map_err(|e| CidxError::Internal(e.to_string()))?)
            .bind(&repo.base_name)
            .execute(&self.pool)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Scans on-disk index markers under the repo's data directory and
    /// rewrites the flag set to match reality, rather than trusting
    /// whatever the registry last recorded.
    pub async fn reconcile_registry(&self, base_name: &str) -> CidxResult<IndexFlags> {
        let repo = self.get_repository(base_name).await?;
        let index_root = self.data_dir.join("indexes").join(&repo.base_name);

        let flags = IndexFlags {
            semantic: index_root.join("vectors").join(".ready").exists(),
            fts: index_root.join("fts").join(".ready").exists(),
            temporal: index_root.join("temporal").join(".ready").exists(),
            scip: index_root.join("scip").join(".ready").exists(),
        };

        sqlx::query("UPDATE repositories SET flags_json = ? WHERE base_name = ?")
            .bind(serde_json::to_string(&flags).map_err(|e| CidxError::Internal(e.to_string()))?)
            .bind(&repo.base_name)
            .execute(&self.pool)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;

        Ok(flags)
    }
}

/// Adapts `RepoManager` to the generic job executor dispatch for the
/// repo-lifecycle job kinds. `AddIndex` only flips the registry flag
/// here; the actual index build is performed by a subsequent
/// `RefreshGoldenRepo` the caller is expected to enqueue (idempotent
/// either way, since `apply_changes` diffs against the stored commit).
pub struct RepoJobExecutor {
    pub manager: Arc<RepoManager>,
    pub pipeline: Arc<dyn IndexPipeline>,
    pub default_timeout: std::time::Duration,
    pub refresh_timeout: std::time::Duration,
}

#[async_trait]
impl JobExecutor for RepoJobExecutor {
    async fn execute(&self, job: &Job) -> CidxResult<serde_json::Value> {
        match &job.kind {
            JobKind::AddGoldenRepo { alias, source_url, branch } => {
                let base = alias.trim_end_matches(cidx_core::model::GLOBAL_SUFFIX);
                self.manager.perform_add_golden_repo(base, source_url, branch).await?;
                Ok(serde_json::json!({ "alias": alias }))
            }
            JobKind::RemoveGoldenRepo { alias } => {
                self.manager.perform_remove_golden_repo(alias).await?;
                Ok(serde_json::json!({ "alias": alias, "removed": true }))
            }
            JobKind::RefreshGoldenRepo { alias } => {
                let changes = self
                    .manager
                    .perform_refresh(alias, self.pipeline.as_ref())
                    .await?;
                Ok(serde_json::json!({
                    "alias": alias,
                    "changed": changes.added_or_modified.len(),
                    "removed": changes.removed.len(),
                }))
            }
            JobKind::AddIndex { alias, index } => {
                self.manager.mark_index_flag(alias, *index).await?;
                Ok(serde_json::json!({ "alias": alias, "index": format!("{index:?}") }))
            }
            JobKind::Reconcile { alias } => {
                let flags = self.manager.reconcile_registry(alias).await?;
                Ok(serde_json::to_value(flags).map_err(|e| CidxError::Internal(e.to_string()))?)
            }
            JobKind::OrphanSweep => {
                warn!("OrphanSweep job reached RepoJobExecutor; it is handled by the queue itself");
                Ok(serde_json::json!({}))
            }
        }
    }

    fn timeout_for(&self, kind: &JobKind) -> std::time::Duration {
        match kind {
            JobKind::RefreshGoldenRepo { .. } | JobKind::AddGoldenRepo { .. } => self.refresh_timeout,
            _ => self.default_timeout,
        }
    }
}

fn clone_repo(url: &str, branch: &str, dest: &PathBuf) -> Result<(), git2::Error> {
    let mut builder = git2::build::RepoBuilder::new();
    builder.branch(branch);
    builder.clone(url, dest)?;
    Ok(())
}

fn fetch_and_reset(path: &PathBuf, branch: &str) -> Result<(), git2::Error> {
    let repo = git2::Repository::open(path)?;
    let mut remote = repo.find_remote("origin")?;
    remote.fetch(&[branch], None, None)?;
    let reference = repo.find_reference(&format!("refs/remotes/origin/{branch}"))?;
    let target = reference.peel_to_commit()?;
    repo.set_head_detached(target.id())?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;
    Ok(())
}

fn current_head(path: &PathBuf) -> Result<String, git2::Error> {
    let repo = git2::Repository::open(path)?;
    Ok(repo.head()?.peel_to_commit()?.id().to_string())
}

fn diff_against(path: &PathBuf, last_commit: Option<&str>) -> Result<ChangeSet, git2::Error> {
    let repo = git2::Repository::open(path)?;
    let head_tree = repo.head()?.peel_to_tree()?;

    let Some(last) = last_commit else {
        // First index: every tracked file counts as added.
        let mut added = Vec::new();
        head_tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                added.push(PathBuf::from(format!("{dir}{}", entry.name().unwrap_or(""))));
            }
            git2::TreeWalkResult::Ok
        })?;
        return Ok(ChangeSet {
            added_or_modified: added,
            removed: Vec::new(),
        });
    };

    let old_oid = git2::Oid::from_str(last)?;
    let old_commit = repo.find_commit(old_oid)?;
    let old_tree = old_commit.tree()?;
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&head_tree), None)?;

    let mut added_or_modified = HashSet::new();
    let mut removed = HashSet::new();
    for delta in diff.deltas() {
        match delta.status() {
            git2::Delta::Deleted => {
                if let Some(p) = delta.old_file().path() {
                    removed.insert(p.to_path_buf());
                }
            }
            _ => {
                if let Some(p) = delta.new_file().path() {
                    added_or_modified.insert(p.to_path_buf());
                }
            }
        }
    }

    Ok(ChangeSet {
        added_or_modified: added_or_modified.into_iter().collect(),
        removed: removed.into_iter().collect(),
    })
}

#[derive(sqlx::FromRow)]
struct RepoRow {
    base_name: String,
    public_alias: String,
    source_url: String,
    default_branch: String,
    clone_path: String,
    created_at: String,
    flags_json: String,
    last_refresh: Option<String>,
    refresh_policy_json: String,
}

impl RepoRow {
    fn into_repository(self) -> CidxResult<Repository> {
        Ok(Repository {
            base_name: self.base_name,
            public_alias: self.public_alias,
            source_url: self.source_url,
            default_branch: self.default_branch,
            clone_path: PathBuf::from(self.clone_path),
            created_at: chrono::DateTime::parse_from_rfc3339(&self.created_at)
                .map_err(|e| CidxError::Internal(e.to_string()))?
                .with_timezone(&Utc),
            flags: serde_json::from_str(&self.flags_json).map_err(|e| CidxError::Internal(e.to_string()))?,
            last_refresh: self
                .last_refresh
                .as_deref()
                .map(|s| {
                    chrono::DateTime::parse_from_rfc3339(s)
                        .map(|d| d.with_timezone(&Utc))
                        .map_err(|e| CidxError::Internal(e.to_string()))
                })
                .transpose()?,
            refresh_policy: serde_json::from_str(&self.refresh_policy_json)
                .map_err(|e| CidxError::Internal(e.to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconcile_reports_no_indexes_when_nothing_on_disk() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::migrate(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = RepoManager::new(pool, dir.path().to_path_buf());

        let repo = Repository::new(
            "foo",
            "https://example.org/foo.git",
            "main",
            dir.path().join("repos/foo"),
            RefreshPolicy::Manual,
        )
        .unwrap();
        manager.insert_repository(&repo).await.unwrap();

        let flags = manager.reconcile_registry("foo").await.unwrap();
        assert!(!flags.semantic && !flags.fts && !flags.temporal && !flags.scip);
    }

    #[tokio::test]
    async fn remove_unknown_repo_is_not_found() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::migrate(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = RepoManager::new(pool, dir.path().to_path_buf());
        let err = manager.perform_remove_golden_repo("ghost").await.unwrap_err();
        assert!(matches!(err, CidxError::NotFound(_)));
    }
}
