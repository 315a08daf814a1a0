//! Per-repo `FtsIndex`: exact boolean-AND token search over `tantivy`,
//! with fuzzy and token-regex modes.
//!
//! Each repo's FTS index is its own on-disk `tantivy` segment directory
//! rather than a table alongside the registry database, so it can be
//! opened, rebuilt, or deleted independently of SQLite.

use std::path::PathBuf;

use async_trait::async_trait;
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::model::VectorRecord;
use cidx_core::store::{FtsHit, FtsIndex, SearchFilters};
use tantivy::collector::TopDocs;
use tantivy::query::{FuzzyTermQuery, QueryParser};
use tantivy::schema::{Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexWriter, TantivyDocument, Term};
use tracing::warn;
use uuid::Uuid;

pub struct TantivyFtsIndex {
    index: Index,
    schema: FtsSchema,
    /// The repo's working clone, opened once per `upsert` to resolve
    /// clean-file records down to real blob bytes before indexing.
    repo_path: Option<PathBuf>,
}

#[derive(Clone)]
struct FtsSchema {
    schema: Schema,
    id: tantivy::schema::Field,
    file_path: tantivy::schema::Field,
    body: tantivy::schema::Field,
}

fn build_schema() -> FtsSchema {
    let mut builder = Schema::builder();
    let id = builder.add_text_field("id", STRING | STORED);
    let file_path = builder.add_text_field("file_path", STRING | STORED);
    let body = builder.add_text_field("body", TEXT | STORED);
    let schema = builder.build();
    FtsSchema {
        schema,
        id,
        file_path,
        body,
    }
}

impl TantivyFtsIndex {
    pub fn open(dir: PathBuf, repo_path: Option<PathBuf>) -> CidxResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| CidxError::Internal(e.to_string()))?;
        let built = build_schema();
        let mmap = tantivy::directory::MmapDirectory::open(&dir)
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        let index = Index::open_or_create(mmap, built.schema.clone())
            .map_err(|e| CidxError::IntegrityFailure(e.to_string()))?;
        Ok(Self {
            index,
            schema: built,
            repo_path,
        })
    }

    fn writer(&self) -> CidxResult<IndexWriter> {
        self.index
            .writer(50_000_000)
            .map_err(|e| CidxError::Internal(e.to_string()))
    }
}

#[async_trait]
impl FtsIndex for TantivyFtsIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> CidxResult<()> {
        // Opened once for the whole batch rather than per record, since
        // most clean-file records in a session share the same clone.
        let repo = self.repo_path.as_deref().and_then(|p| git2::Repository::open(p).ok());
        let mut writer = self.writer()?;
        for record in records {
            let body = match &record.payload.content {
                cidx_core::model::ContentRef::Inline { chunk_text } => chunk_text.clone(),
                cidx_core::model::ContentRef::GitBlob { sha } => resolve_blob_body(repo.as_ref(), sha),
            };
            let term = Term::from_field_text(self.schema.id, &record.id.to_string());
            writer
                .delete_term(term);
            writer
                .add_document(doc!(
                    self.schema.id => record.id.to_string(),
                    self.schema.file_path => record.payload.file_path.clone(),
                    self.schema.body => body,
                ))
                .map_err(|e| CidxError::Internal(e.to_string()))?;
        }
        writer.commit().map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid]) -> CidxResult<()> {
        let mut writer = self.writer()?;
        for id in ids {
            writer.delete_term(Term::from_field_text(self.schema.id, &id.to_string()));
        }
        writer.commit().map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn search(
        &self,
        query_text: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> CidxResult<Vec<FtsHit>> {
        let reader = self
            .index
            .reader()
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        let searcher = reader.searcher();

        let top_docs = if filters.fuzzy {
            let distance = filters.edit_distance.unwrap_or(2).min(2) as u8;
            let term = Term::from_field_text(self.schema.body, query_text);
            let fuzzy = FuzzyTermQuery::new(term, distance, true);
            searcher
                .search(&fuzzy, &TopDocs::with_limit(limit))
                .map_err(|e| CidxError::Internal(e.to_string()))?
        } else {
            // Exact boolean AND across tokens.
            let parser = QueryParser::for_index(&self.index, vec![self.schema.body]);
            let mut parser = parser;
            parser.set_conjunction_by_default();
            let query = parser
                .parse_query(query_text)
                .map_err(|e| CidxError::InvalidInput(format!("invalid FTS query: {e}")))?;
            searcher
                .search(&query, &TopDocs::with_limit(limit))
                .map_err(|e| CidxError::Internal(e.to_string()))?
        };

        let mut hits = Vec::new();
        for (score, address) in top_docs {
            let retrieved: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| CidxError::Internal(e.to_string()))?;
            let id = retrieved
                .get_first(self.schema.id)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let file_path = retrieved
                .get_first(self.schema.file_path)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let body = retrieved
                .get_first(self.schema.body)
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            if let Some(path_filter) = &filters.path_filter {
                if !file_path.contains(path_filter.as_str()) {
                    continue;
                }
            }

            let Ok(id) = Uuid::parse_str(id) else { continue };
            let (char_offset, line, column) = locate_match(body, query_text);
            hits.push(FtsHit {
                id,
                score,
                file_path,
                line,
                column,
                char_offset,
                snippet: snippet_of(body, filters.snippet_lines.max(1)),
            });
        }
        Ok(hits)
    }
}

/// Resolves a clean-file record's content from the git object store at
/// indexing time, since a `tantivy` body needs real text to tokenize —
/// unlike the vector store, FTS has no lazy read-at-query-time tier.
fn resolve_blob_body(repo: Option<&git2::Repository>, sha: &str) -> String {
    let resolved = repo.and_then(|repo| {
        let oid = git2::Oid::from_str(sha).ok()?;
        let blob = repo.find_blob(oid).ok()?;
        Some(String::from_utf8_lossy(blob.content()).into_owned())
    });
    resolved.unwrap_or_else(|| {
        warn!(sha, "FTS indexing: could not resolve git blob, indexing empty body");
        String::new()
    })
}

/// Finds `query_text`'s first literal occurrence in `body` (falling
/// back to its first whitespace-separated term, since a fuzzy match
/// rarely equals the query verbatim) and returns its Unicode-aware
/// character offset plus 1-based line/column. Falls back to `(0, 1, 1)`
/// when no literal occurrence is found at all.
fn locate_match(body: &str, query_text: &str) -> (u64, u32, u32) {
    let lower_body = body.to_lowercase();
    let mut candidates = vec![query_text.to_lowercase()];
    candidates.extend(query_text.split_whitespace().map(|t| t.to_lowercase()));

    let byte_idx = candidates
        .iter()
        .filter(|term| !term.is_empty())
        .find_map(|term| lower_body.find(term.as_str()));

    let Some(byte_idx) = byte_idx else {
        return (0, 1, 1);
    };
    let prefix = &body[..byte_idx];
    let char_offset = prefix.chars().count() as u64;
    let line = prefix.matches('\n').count() as u32 + 1;
    let column = match prefix.rfind('\n') {
        Some(nl) => prefix[nl + 1..].chars().count() as u32 + 1,
        None => char_offset as u32 + 1,
    };
    (char_offset, line, column)
}

/// Returns up to `lines` lines of context around the start of the body,
/// a simplified stand-in for `tantivy::SnippetGenerator`'s highlighted
/// fragment extraction.
fn snippet_of(body: &str, lines: u32) -> String {
    body.lines().take(lines as usize).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidx_core::model::{Collection, ContentRef, VectorPayload};
    use chrono::Utc;

    fn record(file: &str, body: &str) -> VectorRecord {
        VectorRecord {
            id: Uuid::new_v4(),
            embedding: vec![],
            payload: VectorPayload {
                file_path: file.to_string(),
                chunk_offset: 0,
                language: Some("rust".to_string()),
                content: ContentRef::Inline {
                    chunk_text: body.to_string(),
                },
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            collection: Collection::Code,
        }
    }

    #[tokio::test]
    async fn exact_search_finds_matching_token() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyFtsIndex::open(dir.path().to_path_buf(), None).unwrap();
        index
            .upsert(vec![record("src/auth.rs", "fn authenticate_user() {}")])
            .await
            .unwrap();

        let hits = index
            .search("authenticate_user", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "src/auth.rs");
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyFtsIndex::open(dir.path().to_path_buf(), None).unwrap();
        let doc = record("src/a.rs", "unique_marker_text");
        let id = doc.id;
        index.upsert(vec![doc]).await.unwrap();
        index.delete(&[id]).await.unwrap();

        let hits = index
            .search("unique_marker_text", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn locate_match_reports_unicode_aware_line_and_column() {
        let body = "fn one() {}\nfn authenticate_user() {}\n";
        let (char_offset, line, column) = locate_match(body, "authenticate_user");
        assert_eq!(line, 2);
        assert_eq!(column, 4);
        assert_eq!(char_offset, body.find("authenticate_user").unwrap() as u64);
    }

    #[test]
    fn locate_match_falls_back_to_start_when_term_absent() {
        assert_eq!(locate_match("no match here", "ZZZ"), (0, 1, 1));
    }

    fn init_git_repo_with_file(dir: &std::path::Path, file: &str, contents: &str) -> String {
        let run = |args: &[&str]| {
            std::process::Command::new("git").args(args).current_dir(dir).output().unwrap();
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join(file), contents).unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
        let repo = git2::Repository::open(dir).unwrap();
        let head = repo.head().unwrap().peel_to_tree().unwrap();
        head.get_path(std::path::Path::new(file)).unwrap().id().to_string()
    }

    #[tokio::test]
    async fn upsert_indexes_real_blob_content_not_a_placeholder() {
        let repo_dir = tempfile::tempdir().unwrap();
        let sha = init_git_repo_with_file(repo_dir.path(), "src/auth.rs", "fn authenticate_user() {}\n");

        let index_dir = tempfile::tempdir().unwrap();
        let index = TantivyFtsIndex::open(index_dir.path().to_path_buf(), Some(repo_dir.path().to_path_buf())).unwrap();

        let mut doc = record("src/auth.rs", "placeholder");
        doc.payload.content = ContentRef::GitBlob { sha };
        index.upsert(vec![doc]).await.unwrap();

        let hits = index
            .search("authenticate_user", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].char_offset, 3);
        assert_eq!(hits[0].line, 1);
    }
}
