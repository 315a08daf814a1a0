//! Concrete index backends and the per-repo registry that wires them
//! together: `FileBackedVectorStore` (HNSW + quantized path tree),
//! `TantivyFtsIndex`, `GitTemporalIndex`, `PetgraphScipIndex`.

pub mod fts;
pub mod scip;
pub mod temporal;
pub mod vector;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cidx_core::error::{CidxError, CidxResult};
use cidx_core::store::{FtsIndex, ScipIndex, TemporalIndex, VectorStore};
use parking_lot::RwLock;

/// Opens the git repo at `repo_path` and reads `sha`'s blob as UTF-8
/// (lossy), the shared lookup behind the vector and FTS stores'
/// git-blob content tier.
pub(crate) fn read_git_blob(repo_path: &Path, sha: &str) -> CidxResult<String> {
    let repo = git2::Repository::open(repo_path)
        .map_err(|e| CidxError::ExternalFailure(format!("failed to open git repo: {e}")))?;
    let oid = git2::Oid::from_str(sha)
        .map_err(|e| CidxError::Internal(format!("invalid blob sha '{sha}': {e}")))?;
    let blob = repo
        .find_blob(oid)
        .map_err(|e| CidxError::NotFound(format!("git blob '{sha}' not found: {e}")))?;
    Ok(String::from_utf8_lossy(blob.content()).into_owned())
}

/// The four index handles a single repo may have open at once. Missing
/// handles mean that index kind hasn't been built yet (`flags.*` on the
/// [`cidx_core::model::Repository`] row tracks which).
#[derive(Clone)]
pub struct RepoStoreHandles {
    pub vector: Option<Arc<dyn VectorStore>>,
    pub fts: Option<Arc<dyn FtsIndex>>,
    pub temporal: Option<Arc<dyn TemporalIndex>>,
    pub scip: Option<Arc<dyn ScipIndex>>,
}

/// Opens and caches per-repo, per-process, reference-counted index
/// handles under `data_dir`.
pub struct StoreRegistry {
    data_dir: PathBuf,
    embedding_dims: usize,
    handles: RwLock<HashMap<String, RepoStoreHandles>>,
}

impl StoreRegistry {
    pub fn new(data_dir: PathBuf, embedding_dims: usize) -> Self {
        Self {
            data_dir,
            embedding_dims,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn handles_for(&self, alias: &str) -> CidxResult<RepoStoreHandles> {
        if let Some(existing) = self.handles.read().get(alias) {
            return Ok(existing.clone());
        }
        self.open_and_cache(alias)
    }

    fn open_and_cache(&self, alias: &str) -> CidxResult<RepoStoreHandles> {
        let root = self.data_dir.join("indexes").join(alias);
        let repo_clone = self.repo_clone_path(alias);

        let vector_dir = root.join("vectors");
        let vector: Option<Arc<dyn VectorStore>> = if vector_dir.exists() {
            Some(Arc::new(vector::FileBackedVectorStore::open(
                vector_dir,
                self.embedding_dims,
                Some(repo_clone.clone()),
            )?))
        } else {
            None
        };

        let fts_dir = root.join("fts");
        let fts: Option<Arc<dyn FtsIndex>> = if fts_dir.exists() {
            Some(Arc::new(fts::TantivyFtsIndex::open(fts_dir, Some(repo_clone.clone()))?))
        } else {
            None
        };

        let temporal: Option<Arc<dyn TemporalIndex>> = if repo_clone.join(".git").exists() {
            Some(Arc::new(temporal::GitTemporalIndex::new(repo_clone)))
        } else {
            None
        };

        let scip_dir = root.join("scip");
        let scip: Option<Arc<dyn ScipIndex>> = if scip_dir.exists() {
            Some(Arc::new(scip::PetgraphScipIndex::new(alias)))
        } else {
            None
        };

        let handles = RepoStoreHandles {
            vector,
            fts,
            temporal,
            scip,
        };
        self.handles.write().insert(alias.to_string(), handles.clone());
        Ok(handles)
    }

    /// Publishes a freshly built handle, draining the old one by simply
    /// dropping the last `Arc` reference once in-flight searches finish
    /// with it.
    pub fn publish_vector_handle(&self, alias: &str, store: Arc<dyn VectorStore>) {
        let mut handles = self.handles.write();
        let entry = handles.entry(alias.to_string()).or_insert(RepoStoreHandles {
            vector: None,
            fts: None,
            temporal: None,
            scip: None,
        });
        entry.vector = Some(store);
    }

    pub fn publish_fts_handle(&self, alias: &str, index: Arc<dyn FtsIndex>) {
        let mut handles = self.handles.write();
        let entry = handles.entry(alias.to_string()).or_insert(RepoStoreHandles {
            vector: None,
            fts: None,
            temporal: None,
            scip: None,
        });
        entry.fts = Some(index);
    }

    pub fn publish_scip_handle(&self, alias: &str, index: Arc<dyn ScipIndex>) {
        let mut handles = self.handles.write();
        let entry = handles.entry(alias.to_string()).or_insert(RepoStoreHandles {
            vector: None,
            fts: None,
            temporal: None,
            scip: None,
        });
        entry.scip = Some(index);
    }

    /// Creates the on-disk vector directory if this is the repo's first
    /// `AddIndex(semantic)` and (re)opens the handle, publishing it so a
    /// concurrent reader never observes a cached "no index" miss from
    /// before the directory existed.
    pub fn ensure_vector(&self, alias: &str) -> CidxResult<Arc<dyn VectorStore>> {
        let dir = self.data_dir.join("indexes").join(alias).join("vectors");
        let store: Arc<dyn VectorStore> = Arc::new(vector::FileBackedVectorStore::open(
            dir,
            self.embedding_dims,
            Some(self.repo_clone_path(alias)),
        )?);
        self.publish_vector_handle(alias, store.clone());
        Ok(store)
    }

    /// Same idempotent "create dir, (re)open, publish" pattern as
    /// [`Self::ensure_vector`], for the FTS index.
    pub fn ensure_fts(&self, alias: &str) -> CidxResult<Arc<dyn FtsIndex>> {
        let dir = self.data_dir.join("indexes").join(alias).join("fts");
        let index: Arc<dyn FtsIndex> = Arc::new(fts::TantivyFtsIndex::open(dir, Some(self.repo_clone_path(alias)))?);
        self.publish_fts_handle(alias, index.clone());
        Ok(index)
    }

    /// Where a repo's working clone lives on disk, git-blob and
    /// current-file content resolution read from this path.
    fn repo_clone_path(&self, alias: &str) -> PathBuf {
        self.data_dir
            .join("repos")
            .join(alias.trim_end_matches(cidx_core::model::GLOBAL_SUFFIX))
    }

    /// Where the external SCIP generator should write its `.scip`
    /// protobuf(s) before [`scip::PetgraphScipIndex::import_scip_file`]
    /// folds them into the graph and deletes the intermediate file.
    pub fn scip_scratch_dir(&self, alias: &str) -> CidxResult<PathBuf> {
        let dir = self.data_dir.join("indexes").join(alias).join("scip");
        std::fs::create_dir_all(&dir).map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(dir)
    }

    pub fn require_vector(&self, alias: &str) -> CidxResult<Arc<dyn VectorStore>> {
        self.handles_for(alias)?
            .vector
            .ok_or_else(|| CidxError::NotFound(format!("repository '{alias}' has no semantic index")))
    }

    pub fn require_fts(&self, alias: &str) -> CidxResult<Arc<dyn FtsIndex>> {
        self.handles_for(alias)?
            .fts
            .ok_or_else(|| CidxError::NotFound(format!("repository '{alias}' has no FTS index")))
    }

    pub fn require_temporal(&self, alias: &str) -> CidxResult<Arc<dyn TemporalIndex>> {
        self.handles_for(alias)?
            .temporal
            .ok_or_else(|| CidxError::NotFound(format!("repository '{alias}' has no temporal index")))
    }

    pub fn require_scip(&self, alias: &str) -> CidxResult<Arc<dyn ScipIndex>> {
        self.handles_for(alias)?
            .scip
            .ok_or_else(|| CidxError::NotFound(format!("repository '{alias}' has no SCIP index")))
    }
}
