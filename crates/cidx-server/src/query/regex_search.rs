//! `regex_search`: DFA-backed regular-expression search across a golden
//! repository's working tree, independent of the semantic/FTS indexes.
//!
//! Walks the tree with `walkdir` (skipping `.git`), and scans each
//! file's body with `regex` rather than chunking it for embedding.

use std::path::{Path, PathBuf};

use cidx_core::error::{CidxError, CidxResult};
use globset::{Glob, GlobSetBuilder};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct RegexSearchRequest {
    pub pattern: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub case_sensitive: bool,
    pub context_lines: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexMatch {
    pub file_path: String,
    pub line: usize,
    pub matched_text: String,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

/// Validates the include/exclude glob lists up front so a malformed
/// pattern is reported as `InvalidInput` instead of silently matching
/// nothing.
fn compile_globset(patterns: &[String]) -> CidxResult<Option<globset::GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| CidxError::InvalidInput(format!("bad glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    Ok(Some(
        builder
            .build()
            .map_err(|e| CidxError::InvalidInput(format!("failed to compile glob set: {e}")))?,
    ))
}

pub async fn regex_search(repo_root: PathBuf, request: RegexSearchRequest) -> CidxResult<Vec<RegexMatch>> {
    let include = compile_globset(&request.include)?;
    let exclude = compile_globset(&request.exclude)?;
    let regex = RegexBuilder::new(&request.pattern)
        .case_insensitive(!request.case_sensitive)
        .build()
        .map_err(|e| CidxError::InvalidInput(format!("invalid regex: {e}")))?;

    tokio::task::spawn_blocking(move || scan_blocking(&repo_root, &regex, include.as_ref(), exclude.as_ref(), &request))
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?
}

fn scan_blocking(
    repo_root: &Path,
    regex: &regex::Regex,
    include: Option<&globset::GlobSet>,
    exclude: Option<&globset::GlobSet>,
    request: &RegexSearchRequest,
) -> CidxResult<Vec<RegexMatch>> {
    let mut matches = Vec::new();

    for entry in WalkDir::new(repo_root).into_iter().filter_entry(|e| e.file_name() != ".git") {
        if matches.len() >= request.limit {
            break;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(repo_root).unwrap_or(entry.path());
        if let Some(include) = include {
            if !include.is_match(relative) {
                continue;
            }
        }
        if let Some(exclude) = exclude {
            if exclude.is_match(relative) {
                continue;
            }
        }

        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue; // binary or unreadable; skip rather than fail the whole search
        };
        let lines: Vec<&str> = text.lines().collect();
        for (idx, line) in lines.iter().enumerate() {
            if matches.len() >= request.limit {
                break;
            }
            if let Some(found) = regex.find(line) {
                let before_start = idx.saturating_sub(request.context_lines);
                let after_end = (idx + request.context_lines + 1).min(lines.len());
                matches.push(RegexMatch {
                    file_path: relative.to_string_lossy().to_string(),
                    line: idx + 1,
                    matched_text: found.as_str().to_string(),
                    context_before: lines[before_start..idx].iter().map(|s| s.to_string()).collect(),
                    context_after: lines[idx + 1..after_end].iter().map(|s| s.to_string()).collect(),
                });
            }
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn finds_matches_and_respects_context_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.rs");
        let mut file = std::fs::File::create(&file_path).unwrap();
        writeln!(file, "fn one() {{}}\nfn two() {{}}\nfn three() {{}}").unwrap();

        let request = RegexSearchRequest {
            pattern: r"fn two".to_string(),
            include: vec![],
            exclude: vec![],
            case_sensitive: true,
            context_lines: 1,
            limit: 10,
        };
        let matches = regex_search(dir.path().to_path_buf(), request).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].context_before, vec!["fn one() {}"]);
        assert_eq!(matches[0].context_after, vec!["fn three() {}"]);
    }

    #[tokio::test]
    async fn invalid_glob_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let request = RegexSearchRequest {
            pattern: "x".to_string(),
            include: vec!["[".to_string()],
            exclude: vec![],
            case_sensitive: true,
            context_lines: 0,
            limit: 10,
        };
        let err = regex_search(dir.path().to_path_buf(), request).await.unwrap_err();
        assert!(matches!(err, CidxError::InvalidInput(_)));
    }
}
