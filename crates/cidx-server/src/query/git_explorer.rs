//! Git exploration tools: log/show/diff/blame/file-history/file-at-rev
//! /search-commits/search-diffs, all read-only `git2` plumbing over a
//! golden repository's clone.
//!
//! Each operation is a narrowly-scoped query function the MCP/REST
//! layers can call directly, rather than a single generic "run git
//! command" entry point.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use cidx_core::error::{CidxError, CidxResult};
use git2::{Repository, Sort};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    pub author: String,
    pub committed_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub status: String,
    pub additions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlameLine {
    pub line: usize,
    pub sha: String,
    pub author: String,
    pub content: String,
}

pub struct GitExplorer {
    repo_root: PathBuf,
}

impl GitExplorer {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    fn open(&self) -> CidxResult<Repository> {
        Repository::open(&self.repo_root).map_err(|e| CidxError::ExternalFailure(format!("failed to open git repo: {e}")))
    }

    pub async fn git_log(&self, limit: usize) -> CidxResult<Vec<CommitSummary>> {
        let root = self.repo_root.clone();
        tokio::task::spawn_blocking(move || git_log_blocking(&root, limit))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    pub async fn git_show_commit(&self, sha: &str) -> CidxResult<(CommitSummary, Vec<DiffEntry>)> {
        let root = self.repo_root.clone();
        let sha = sha.to_string();
        tokio::task::spawn_blocking(move || show_commit_blocking(&root, &sha))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    pub async fn git_diff(&self, from: &str, to: &str) -> CidxResult<Vec<DiffEntry>> {
        let root = self.repo_root.clone();
        let (from, to) = (from.to_string(), to.to_string());
        tokio::task::spawn_blocking(move || diff_blocking(&root, &from, &to))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    pub async fn git_blame(&self, file_path: &str) -> CidxResult<Vec<BlameLine>> {
        let root = self.repo_root.clone();
        let file_path = file_path.to_string();
        tokio::task::spawn_blocking(move || blame_blocking(&root, &file_path))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    pub async fn git_file_history(&self, file_path: &str, limit: usize) -> CidxResult<Vec<CommitSummary>> {
        let root = self.repo_root.clone();
        let file_path = file_path.to_string();
        tokio::task::spawn_blocking(move || file_history_blocking(&root, &file_path, limit))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    pub async fn git_file_at_revision(&self, file_path: &str, sha: &str) -> CidxResult<String> {
        let root = self.repo_root.clone();
        let (file_path, sha) = (file_path.to_string(), sha.to_string());
        tokio::task::spawn_blocking(move || file_at_revision_blocking(&root, &file_path, &sha))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    pub async fn git_search_commits(&self, query: &str, limit: usize) -> CidxResult<Vec<CommitSummary>> {
        let root = self.repo_root.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || search_commits_blocking(&root, &query, limit))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }

    pub async fn git_search_diffs(&self, query: &str, limit: usize) -> CidxResult<Vec<CommitSummary>> {
        let root = self.repo_root.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || search_diffs_blocking(&root, &query, limit))
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
    }
}

fn summarize(commit: &git2::Commit) -> CommitSummary {
    CommitSummary {
        sha: commit.id().to_string(),
        author: commit.author().name().unwrap_or("unknown").to_string(),
        committed_at: Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now),
        message: commit.message().unwrap_or("").trim().to_string(),
    }
}

fn revwalk_from_head(repo: &Repository) -> CidxResult<git2::Revwalk<'_>> {
    let mut revwalk = repo.revwalk().map_err(|e| CidxError::Internal(e.to_string()))?;
    revwalk.push_head().map_err(|e| CidxError::Internal(e.to_string()))?;
    revwalk.set_sorting(Sort::TIME).map_err(|e| CidxError::Internal(e.to_string()))?;
    Ok(revwalk)
}

fn git_log_blocking(root: &Path, limit: usize) -> CidxResult<Vec<CommitSummary>> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let revwalk = revwalk_from_head(&repo)?;
    let mut out = Vec::new();
    for oid in revwalk.take(limit) {
        let oid = oid.map_err(|e| CidxError::Internal(e.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|e| CidxError::Internal(e.to_string()))?;
        out.push(summarize(&commit));
    }
    Ok(out)
}

fn diff_between(repo: &Repository, old: &git2::Tree, new: &git2::Tree) -> CidxResult<Vec<DiffEntry>> {
    let diff = repo
        .diff_tree_to_tree(Some(old), Some(new), None)
        .map_err(|e| CidxError::Internal(e.to_string()))?;
    let mut stats_by_path: std::collections::HashMap<String, (usize, usize)> = std::collections::HashMap::new();
    diff.foreach(
        &mut |delta, _| {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            stats_by_path.entry(path).or_insert((0, 0));
            true
        },
        None,
        Some(&mut |delta, hunk| {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            // approximate: counted per hunk header, refined per-line below
            let _ = hunk;
            stats_by_path.entry(path).or_insert((0, 0));
            true
        }),
        Some(&mut |delta, _hunk, line| {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let entry = stats_by_path.entry(path).or_insert((0, 0));
            match line.origin() {
                '+' => entry.0 += 1,
                '-' => entry.1 += 1,
                _ => {}
            }
            true
        }),
    )
    .map_err(|e| CidxError::Internal(e.to_string()))?;

    let mut out = Vec::new();
    for delta in diff.deltas() {
        let path = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let (additions, deletions) = stats_by_path.get(&path).copied().unwrap_or((0, 0));
        out.push(DiffEntry {
            path,
            status: format!("{:?}", delta.status()),
            additions,
            deletions,
        });
    }
    Ok(out)
}

fn show_commit_blocking(root: &Path, sha: &str) -> CidxResult<(CommitSummary, Vec<DiffEntry>)> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let oid = git2::Oid::from_str(sha).map_err(|e| CidxError::InvalidInput(e.to_string()))?;
    let commit = repo
        .find_commit(oid)
        .map_err(|_| CidxError::NotFound(format!("commit '{sha}' not found")))?;
    let tree = commit.tree().map_err(|e| CidxError::Internal(e.to_string()))?;
    let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());
    let empty_tree;
    let old_tree = match &parent_tree {
        Some(t) => t,
        None => {
            empty_tree = repo
                .treebuilder(None)
                .and_then(|b| b.write())
                .and_then(|oid| repo.find_tree(oid))
                .map_err(|e| CidxError::Internal(e.to_string()))?;
            &empty_tree
        }
    };
    let diffs = diff_between(&repo, old_tree, &tree)?;
    Ok((summarize(&commit), diffs))
}

fn resolve_tree<'a>(repo: &'a Repository, revision: &str) -> CidxResult<git2::Tree<'a>> {
    let object = repo
        .revparse_single(revision)
        .map_err(|_| CidxError::NotFound(format!("revision '{revision}' not found")))?;
    object
        .peel_to_tree()
        .map_err(|e| CidxError::Internal(e.to_string()))
}

fn diff_blocking(root: &Path, from: &str, to: &str) -> CidxResult<Vec<DiffEntry>> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let from_tree = resolve_tree(&repo, from)?;
    let to_tree = resolve_tree(&repo, to)?;
    diff_between(&repo, &from_tree, &to_tree)
}

fn blame_blocking(root: &Path, file_path: &str) -> CidxResult<Vec<BlameLine>> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let blame = repo
        .blame_file(Path::new(file_path), None)
        .map_err(|e| CidxError::NotFound(format!("blame failed for '{file_path}': {e}")))?;

    let head = repo.head().map_err(|e| CidxError::Internal(e.to_string()))?;
    let commit = head.peel_to_commit().map_err(|e| CidxError::Internal(e.to_string()))?;
    let tree = commit.tree().map_err(|e| CidxError::Internal(e.to_string()))?;
    let blob_entry = tree
        .get_path(Path::new(file_path))
        .map_err(|_| CidxError::NotFound(format!("'{file_path}' not found at HEAD")))?;
    let blob = repo
        .find_blob(blob_entry.id())
        .map_err(|e| CidxError::Internal(e.to_string()))?;
    let content = String::from_utf8_lossy(blob.content());
    let lines: Vec<&str> = content.lines().collect();

    let mut out = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;
        if let Some(hunk) = blame.get_line(line_no) {
            let sig = hunk.final_signature();
            out.push(BlameLine {
                line: line_no,
                sha: hunk.final_commit_id().to_string(),
                author: sig.name().unwrap_or("unknown").to_string(),
                content: line.to_string(),
            });
        }
    }
    Ok(out)
}

fn file_history_blocking(root: &Path, file_path: &str, limit: usize) -> CidxResult<Vec<CommitSummary>> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let revwalk = revwalk_from_head(&repo)?;
    let mut out = Vec::new();
    let mut previous_tree: Option<git2::Tree> = None;
    for oid in revwalk {
        if out.len() >= limit {
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
                diff.deltas().any(|d| {
                    d.new_file()
                        .path()
                        .map(|p| p.to_string_lossy() == file_path)
                        .unwrap_or(false)
                })
            }
        };
        previous_tree = Some(tree);
        if touched {
            out.push(summarize(&commit));
        }
    }
    Ok(out)
}

fn file_at_revision_blocking(root: &Path, file_path: &str, sha: &str) -> CidxResult<String> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let tree = resolve_tree(&repo, sha)?;
    let entry = tree
        .get_path(Path::new(file_path))
        .map_err(|_| CidxError::NotFound(format!("'{file_path}' not found at '{sha}'")))?;
    let blob = repo
        .find_blob(entry.id())
        .map_err(|e| CidxError::Internal(e.to_string()))?;
    Ok(String::from_utf8_lossy(blob.content()).to_string())
}

fn search_commits_blocking(root: &Path, query: &str, limit: usize) -> CidxResult<Vec<CommitSummary>> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let revwalk = revwalk_from_head(&repo)?;
    let mut out = Vec::new();
    for oid in revwalk {
        if out.len() >= limit {
            break;
        }
        let oid = oid.map_err(|e| CidxError::Internal(e.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|e| CidxError::Internal(e.to_string()))?;
        if commit.message().unwrap_or("").to_lowercase().contains(&query.to_lowercase()) {
            out.push(summarize(&commit));
        }
    }
    Ok(out)
}

fn search_diffs_blocking(root: &Path, query: &str, limit: usize) -> CidxResult<Vec<CommitSummary>> {
    let repo = Repository::open(root).map_err(|e| CidxError::ExternalFailure(e.to_string()))?;
    let revwalk = revwalk_from_head(&repo)?;
    let mut out = Vec::new();
    let mut previous_tree: Option<git2::Tree> = None;
    for oid in revwalk {
        if out.len() >= limit {
            break;
        }
        let oid = oid.map_err(|e| CidxError::Internal(e.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|e| CidxError::Internal(e.to_string()))?;
        let tree = commit.tree().map_err(|e| CidxError::Internal(e.to_string()))?;

        if let Some(prev) = &previous_tree {
            let diff = repo
                .diff_tree_to_tree(Some(&tree), Some(prev), None)
                .map_err(|e| CidxError::Internal(e.to_string()))?;
            let mut matched = false;
            diff.print(git2::DiffFormat::Patch, |_, _, line| {
                if let Ok(text) = std::str::from_utf8(line.content()) {
                    if text.to_lowercase().contains(&query.to_lowercase()) {
                        matched = true;
                    }
                }
                true
            })
            .map_err(|e| CidxError::Internal(e.to_string()))?;
            if matched {
                out.push(summarize(&commit));
            }
        }
        previous_tree = Some(tree);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_repo_with_two_commits(dir: &Path) {
        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(dir).output().unwrap();
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("a.txt"), "hello\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial commit"]);
        std::fs::write(dir.join("a.txt"), "hello\nworld\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "add world line"]);
    }

    #[tokio::test]
    async fn git_log_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_two_commits(dir.path());
        let explorer = GitExplorer::new(dir.path().to_path_buf());
        let log = explorer.git_log(10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "add world line");
    }

    #[tokio::test]
    async fn search_commits_matches_message_substring() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_two_commits(dir.path());
        let explorer = GitExplorer::new(dir.path().to_path_buf());
        let found = explorer.git_search_commits("world", 10).await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
