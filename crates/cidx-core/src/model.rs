//! Core data model: repositories, jobs, vector records, identity, cache
//! handles, and correlation IDs.
//!
//! Plain `Serialize`/`Deserialize` structs with no storage-backend
//! knowledge — the repository/job/ACL model a multi-tenant code
//! intelligence server needs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CidxError;

/// Suffix every public (golden) repository alias must carry, and which
/// no user-supplied alias may itself end in.
pub const GLOBAL_SUFFIX: &str = "-global";

/// The reserved synthetic repository holding cross-repo descriptions and
/// the `dependency-map/` discovery directory. Excluded from wildcard
/// `*-global` fan-outs unless explicitly named (§9 Open Question).
pub const META_REPO_ALIAS: &str = "cidx-meta-global";

// ───────────────────────────── Repository ─────────────────────────────

/// Which indexes currently exist on disk for a repository.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexFlags {
    pub semantic: bool,
    pub fts: bool,
    pub temporal: bool,
    pub scip: bool,
}

/// How a golden repository is kept fresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Never refreshed automatically; only via explicit `RefreshGoldenRepo`.
    Manual,
    /// Refreshed by the scheduler every `interval_secs` seconds.
    Scheduled { interval_secs: u64 },
}

/// An admin-registered, indexed, read-only-except-via-activation
/// repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Admin-assigned base name (never ends in `-global`).
    pub base_name: String,
    /// `{base_name}-global`, the alias queries use.
    pub public_alias: String,
    pub source_url: String,
    pub default_branch: String,
    pub clone_path: std::path::PathBuf,
    pub created_at: DateTime<Utc>,
    pub flags: IndexFlags,
    pub last_refresh: Option<DateTime<Utc>>,
    pub refresh_policy: RefreshPolicy,
}

impl Repository {
    /// Construct a new golden repository, enforcing the alias invariant:
    /// `public_alias == base_name + "-global"`, and rejecting base names
    /// that already end in `-global` (reserved, never user-assignable).
    pub fn new(
        base_name: impl Into<String>,
        source_url: impl Into<String>,
        default_branch: impl Into<String>,
        clone_path: std::path::PathBuf,
        refresh_policy: RefreshPolicy,
    ) -> Result<Self, CidxError> {
        let base_name = base_name.into();
        if base_name.ends_with(GLOBAL_SUFFIX) {
            return Err(CidxError::InvalidInput(format!(
                "'{base_name}' is reserved — repository base names must not end in '{GLOBAL_SUFFIX}'"
            )));
        }
        if base_name.trim().is_empty() {
            return Err(CidxError::InvalidInput(
                "repository base name must not be empty".to_string(),
            ));
        }
        let public_alias = format!("{base_name}{GLOBAL_SUFFIX}");
        Ok(Self {
            base_name,
            public_alias,
            source_url: source_url.into(),
            default_branch: default_branch.into(),
            clone_path,
            created_at: Utc::now(),
            flags: IndexFlags::default(),
            last_refresh: None,
            refresh_policy,
        })
    }

    /// Whether this repository participates in an unqualified `*-global`
    /// wildcard expansion. Per the chosen Open-Question resolution, the
    /// reserved meta repository is excluded unless explicitly listed.
    pub fn participates_in_wildcard(&self) -> bool {
        self.public_alias != META_REPO_ALIAS
    }
}

/// A per-user writable clone of a Golden Repository, keyed by
/// `(user, user_alias)`. Shares no index with the golden original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedRepository {
    pub user: String,
    pub user_alias: String,
    pub golden_base_name: String,
    pub working_tree: std::path::PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ActivatedRepository {
    pub fn new(
        user: impl Into<String>,
        user_alias: impl Into<String>,
        golden_base_name: impl Into<String>,
        working_tree: std::path::PathBuf,
    ) -> Result<Self, CidxError> {
        let user_alias = user_alias.into();
        if user_alias.ends_with(GLOBAL_SUFFIX) {
            return Err(CidxError::InvalidInput(format!(
                "user alias '{user_alias}' must not end in the reserved '{GLOBAL_SUFFIX}' suffix"
            )));
        }
        Ok(Self {
            user: user.into(),
            user_alias,
            golden_base_name: golden_base_name.into(),
            working_tree,
            created_at: Utc::now(),
        })
    }
}

// ───────────────────────────── Identity / ACL ─────────────────────────────

/// A permission token. Groups carry a set of these; tools declare one as
/// `required_permission`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    QueryRepos,
    ActivateRepos,
    RepositoryRead,
    RepositoryWrite,
    RepositoryAdmin,
    ManageUsers,
    ManageGoldenRepos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub accessible_repos: HashSet<String>,
    pub permissions: HashSet<Permission>,
}

impl Group {
    /// `R ∈ access(group)` — repository access per the ACL invariant
    ///. Matches by public alias or base name.
    pub fn can_access_repo(&self, repo_alias: &str) -> bool {
        self.accessible_repos.contains(repo_alias)
            || self
                .accessible_repos
                .iter()
                .any(|r| r == repo_alias.trim_end_matches(GLOBAL_SUFFIX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub group: String,
}

/// A live session, carrying either the authenticated user's identity or
/// an admin-set impersonation target. Impersonation only ever
/// *constrains* (see [`EffectiveIdentity::permissions`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub username: String,
    pub impersonating: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// The identity permission checks should evaluate against: the
    /// impersonation target if set, else the caller themselves.
    pub fn effective_username(&self) -> &str {
        self.impersonating.as_deref().unwrap_or(&self.username)
    }
}

/// An append-only audit record (§4.6 "Audit").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub acting_as: Option<String>,
    pub action: String,
    pub target: Option<String>,
    pub correlation_id: CorrelationId,
    pub outcome: AuditOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Error,
}

// ───────────────────────────── Job ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// Which index backend a job targets, per `AddIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Semantic,
    Fts,
    Temporal,
    Scip,
}

/// The kind of work a [`Job`] performs, plus the identifying key used for
/// duplicate suppression (`(kind, target-key)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    AddGoldenRepo {
        alias: String,
        source_url: String,
        branch: String,
    },
    RemoveGoldenRepo { alias: String },
    RefreshGoldenRepo { alias: String },
    AddIndex { alias: String, index: IndexKind },
    Reconcile { alias: String },
    OrphanSweep,
}

impl JobKind {
    /// Label used in the `(kind, target-key)` dedup tuple. Two jobs with
    /// the same `kind_label()` and [`target_key`](JobKind::target_key)
    /// may never both be pending/running.
    pub fn kind_label(&self) -> &'static str {
        match self {
            JobKind::AddGoldenRepo { .. } => "add_golden_repo",
            JobKind::RemoveGoldenRepo { .. } => "remove_golden_repo",
            JobKind::RefreshGoldenRepo { .. } => "refresh_golden_repo",
            JobKind::AddIndex { .. } => "add_index",
            JobKind::Reconcile { .. } => "reconcile",
            JobKind::OrphanSweep => "orphan_sweep",
        }
    }

    pub fn target_key(&self) -> String {
        match self {
            JobKind::AddGoldenRepo { alias, .. }
            | JobKind::RemoveGoldenRepo { alias }
            | JobKind::RefreshGoldenRepo { alias }
            | JobKind::Reconcile { alias } => alias.clone(),
            JobKind::AddIndex { alias, index } => format!("{alias}:{index:?}"),
            JobKind::OrphanSweep => "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub username: String,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub callback_url: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, username: impl Into<String>, callback_url: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            username: username.into(),
            status: JobStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            callback_url,
        }
    }
}

// ───────────────────────────── Vector record ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Code,
    Multimodal,
}

/// Content-retrieval tiers, tried in order at read time. Only `GitBlob` or `Inline` is ever
/// persisted; `CurrentFile` is tried first but never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContentRef {
    /// Clean, tracked file: reconstruct from the git object store.
    GitBlob { sha: String },
    /// Dirty or non-git file: the chunk text is stored inline.
    Inline { chunk_text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub file_path: String,
    pub chunk_offset: u64,
    pub language: Option<String>,
    pub content: ContentRef,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: Uuid,
    pub embedding: Vec<f32>,
    pub payload: VectorPayload,
    pub collection: Collection,
}

// ───────────────────────────── Cache handle / correlation ─────────────────────────────

/// Opaque, session-scoped key mapping to `(session, full_content,
/// page_size)`. Single-owner: readable only within the issuing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheHandle(pub Uuid);

impl CacheHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CacheHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A string propagated through every log line, error, and outbound call
/// for a single inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_alias_invariant_holds() {
        let repo = Repository::new(
            "foo",
            "https://example.org/foo.git",
            "main",
            "/tmp/foo".into(),
            RefreshPolicy::Manual,
        )
        .unwrap();
        assert_eq!(repo.public_alias, "foo-global");
    }

    #[test]
    fn repository_rejects_reserved_base_name() {
        let err = Repository::new(
            "foo-global",
            "https://example.org/foo.git",
            "main",
            "/tmp/foo".into(),
            RefreshPolicy::Manual,
        )
        .unwrap_err();
        assert!(matches!(err, CidxError::InvalidInput(_)));
    }

    #[test]
    fn meta_repo_excluded_from_wildcard() {
        let meta = Repository {
            base_name: "cidx-meta".to_string(),
            public_alias: META_REPO_ALIAS.to_string(),
            source_url: String::new(),
            default_branch: "main".to_string(),
            clone_path: "/tmp/meta".into(),
            created_at: Utc::now(),
            flags: IndexFlags::default(),
            last_refresh: None,
            refresh_policy: RefreshPolicy::Manual,
        };
        assert!(!meta.participates_in_wildcard());
    }

    #[test]
    fn job_kind_dedup_key_is_stable() {
        let a = JobKind::RefreshGoldenRepo {
            alias: "foo-global".to_string(),
        };
        let b = JobKind::RefreshGoldenRepo {
            alias: "foo-global".to_string(),
        };
        assert_eq!(a.kind_label(), b.kind_label());
        assert_eq!(a.target_key(), b.target_key());
    }

    #[test]
    fn activated_repo_rejects_global_suffix() {
        let err = ActivatedRepository::new("alice", "mine-global", "foo", "/tmp/mine".into())
            .unwrap_err();
        assert!(matches!(err, CidxError::InvalidInput(_)));
    }
}
