//! Bridges [`crate::repo::IndexPipeline`] to the concrete vector/FTS/
//! SCIP backends held by [`crate::store::StoreRegistry`]: chunks and
//! embeds changed files for the semantic/FTS indexes, and shells out to
//! the external, per-language SCIP generator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cidx_core::chunk::{chunk_file, chunk_id, MAX_CHUNKS_PER_FILE};
use cidx_core::embedding::EmbeddingProvider;
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::model::{Collection, ContentRef, VectorPayload, VectorRecord, GLOBAL_SUFFIX};
use tracing::warn;
use uuid::Uuid;

use crate::repo::{ChangeSet, IndexPipeline, RepoManager};
use crate::store::scip::PetgraphScipIndex;
use crate::store::StoreRegistry;

pub struct StorePipeline {
    repos: Arc<RepoManager>,
    stores: Arc<StoreRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_max_tokens: usize,
    scip_generator_command: Option<String>,
}

impl StorePipeline {
    pub fn new(
        repos: Arc<RepoManager>,
        stores: Arc<StoreRegistry>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunk_max_tokens: usize,
        scip_generator_command: Option<String>,
    ) -> Self {
        Self {
            repos,
            stores,
            embedder,
            chunk_max_tokens,
            scip_generator_command,
        }
    }

    /// Every chunk index this file could ever have occupied, under past
    /// or present revisions, so a delete always reaches the full tail
    /// of a shrunk-or-removed file.
    fn tombstone_ids(&self, alias: &str, path: &Path) -> Vec<Uuid> {
        let file_path = normalize(path);
        (0..MAX_CHUNKS_PER_FILE).map(|i| chunk_id(alias, &file_path, i)).collect()
    }

    async fn build_records(
        &self,
        alias: &str,
        clone_path: &Path,
        path: &Path,
        need_embeddings: bool,
    ) -> CidxResult<Vec<VectorRecord>> {
        let file_path = normalize(path);
        let bytes = match tokio::fs::read(clone_path.join(path)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %file_path, error = %e, "skipping unreadable file during indexing");
                return Ok(Vec::new());
            }
        };
        let Ok(text) = String::from_utf8(bytes) else {
            // Binary file: nothing to chunk/search.
            return Ok(Vec::new());
        };

        let chunks = chunk_file(alias, &file_path, &text, self.chunk_max_tokens);
        let embeddings = if need_embeddings {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            self.embedder.embed(&texts).await?
        } else {
            vec![Vec::new(); chunks.len()]
        };

        let blob_sha = git_blob_sha(clone_path.to_path_buf(), path.to_path_buf()).await;
        let language = language_of(&file_path);
        let now = Utc::now();

        Ok(chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let content = match &blob_sha {
                    Some(sha) => ContentRef::GitBlob { sha: sha.clone() },
                    None => ContentRef::Inline { chunk_text: chunk.text.clone() },
                };
                VectorRecord {
                    id: chunk.id,
                    embedding,
                    payload: VectorPayload {
                        file_path: file_path.clone(),
                        chunk_offset: chunk.chunk_index,
                        language: language.clone(),
                        content,
                        created_at: now,
                        updated_at: now,
                    },
                    collection: Collection::Code,
                }
            })
            .collect())
    }
}

#[async_trait]
impl IndexPipeline for StorePipeline {
    async fn apply_changes(&self, alias: &str, changes: &ChangeSet) -> CidxResult<()> {
        let base = alias.trim_end_matches(GLOBAL_SUFFIX);
        let repo = self.repos.get_repository(base).await?;
        if !repo.flags.semantic && !repo.flags.fts {
            return Ok(());
        }
        let clone_path = repo.clone_path.clone();

        // Chunked once and shared between the two backends — FTS never
        // reads the embedding field, so there is no need to re-chunk
        // and re-embed the same files twice when both flags are set.
        let mut tombstones = Vec::new();
        let mut records = Vec::new();
        for path in &changes.added_or_modified {
            tombstones.extend(self.tombstone_ids(alias, path));
            records.extend(
                self.build_records(alias, &clone_path, path, repo.flags.semantic)
                    .await?,
            );
        }
        for path in &changes.removed {
            tombstones.extend(self.tombstone_ids(alias, path));
        }

        if repo.flags.semantic {
            let store = self.stores.ensure_vector(alias)?;
            if !tombstones.is_empty() {
                store.delete(&tombstones).await?;
            }
            if !records.is_empty() {
                store.upsert(records.clone()).await?;
            }
        }

        if repo.flags.fts {
            let fts = self.stores.ensure_fts(alias)?;
            if !tombstones.is_empty() {
                fts.delete(&tombstones).await?;
            }
            if !records.is_empty() {
                fts.upsert(records).await?;
            }
        }

        Ok(())
    }

    /// FTS has no ANN graph to keep warm, so there is nothing beyond
    /// what [`Self::apply_changes`] already did above; this exists
    /// because the refresh algorithm calls both unconditionally and some
    /// backends (fuzzy-index compaction, segment merges) may need a
    /// separate pass later.
    async fn rebuild_fts_incremental(&self, _alias: &str, _changes: &ChangeSet) -> CidxResult<()> {
        Ok(())
    }

    async fn generate_and_import_scip(&self, alias: &str, clone_path: &PathBuf) -> CidxResult<()> {
        let Some(command) = &self.scip_generator_command else {
            return Err(CidxError::ExternalFailure(
                "no indexing.scip_generator_command configured".to_string(),
            ));
        };
        let out_dir = self.stores.scip_scratch_dir(alias)?;

        let status = tokio::process::Command::new(command)
            .arg(clone_path)
            .arg(&out_dir)
            .status()
            .await
            .map_err(|e| CidxError::ExternalFailure(format!("failed to spawn SCIP generator: {e}")))?;
        if !status.success() {
            return Err(CidxError::ExternalFailure(format!(
                "SCIP generator exited with {status}"
            )));
        }

        let index = Arc::new(PetgraphScipIndex::new(alias));
        let mut saw_any = false;
        let mut entries = tokio::fs::read_dir(&out_dir)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "scip") {
                index.import_scip_file(path).await?;
                saw_any = true;
            }
        }
        if !saw_any {
            warn!(alias, "SCIP generator produced no .scip files");
        }
        self.stores.publish_scip_handle(alias, index);
        Ok(())
    }
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

async fn git_blob_sha(clone_path: PathBuf, rel_path: PathBuf) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        let repo = git2::Repository::open(&clone_path).ok()?;
        let tree = repo.head().ok()?.peel_to_tree().ok()?;
        let entry = tree.get_path(&rel_path).ok()?;
        Some(entry.id().to_string())
    })
    .await
    .ok()
    .flatten()
}

/// Coarse extension-to-language map covering the languages the rest of
/// the corpus (SCIP, embedding prompts, search filters) names by
/// example; unknown extensions carry no language filter rather than a
/// guess.
fn language_of(file_path: &str) -> Option<String> {
    let ext = Path::new(file_path).extension()?.to_str()?;
    let lang = match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "rb" => "ruby",
        "md" => "markdown",
        _ => return None,
    };
    Some(lang.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_of_known_extension() {
        assert_eq!(language_of("src/main.rs"), Some("rust".to_string()));
    }

    #[test]
    fn language_of_unknown_extension_is_none() {
        assert_eq!(language_of("README"), None);
    }

    #[test]
    fn normalize_converts_windows_separators() {
        assert_eq!(normalize(Path::new("src\\a.rs")), "src/a.rs");
    }
}
