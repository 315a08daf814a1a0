//! Configuration parsing and validation.
//!
//! CIDX is configured via a TOML file (default: `config/cidxd.toml`): a
//! top-level `Config` struct deserialized with `serde`, defaults
//! supplied via `#[serde(default = "...")]` functions, then checked by
//! [`load_config`] with `anyhow::bail!` rather than relying on `serde`
//! alone to reject bad values.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite file backing the registry, job queue, users/groups, and
    /// audit log. Vector/FTS/SCIP data lives under `storage.data_dir`.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for per-repo clones, quantized vector trees,
    /// tantivy FTS indexes, and SCIP databases.
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            model: None,
            dims: None,
            max_tokens_per_request: default_max_tokens_per_request(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_tokens_per_request() -> usize {
    120_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

fn default_query_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_background_jobs: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_refresh")]
    pub max_concurrent_refresh: usize,
    #[serde(default = "default_callback_result_ttl_secs")]
    pub callback_result_ttl_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_background_jobs: default_max_concurrent_jobs(),
            default_job_timeout_secs: default_job_timeout_secs(),
            max_concurrent_refresh: default_max_concurrent_refresh(),
            callback_result_ttl_secs: default_callback_result_ttl_secs(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    5
}
fn default_job_timeout_secs() -> u64 {
    600
}
fn default_max_concurrent_refresh() -> usize {
    2
}
fn default_callback_result_ttl_secs() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_content_token_threshold")]
    pub content_token_threshold: usize,
    #[serde(default = "default_cache_page_tokens")]
    pub cache_page_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            content_token_threshold: default_content_token_threshold(),
            cache_page_tokens: default_cache_page_tokens(),
        }
    }
}

fn default_content_token_threshold() -> usize {
    5_000
}
fn default_cache_page_tokens() -> usize {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

fn default_session_ttl_secs() -> u64 {
    900
}

/// Settings for the indexing pipeline: how large a chunk may grow
/// before it is split, and the external, per-language SCIP generator
/// invoked at `AddIndex(scip)`/refresh time.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    /// Shell command run as `<command> <clone_path> <output_dir>`,
    /// expected to write one or more `.scip` protobuf files into
    /// `output_dir`. `None` means no SCIP backend is configured;
    /// `AddIndex(scip)` then fails with `ExternalFailure`.
    #[serde(default)]
    pub scip_generator_command: Option<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_max_tokens: default_chunk_max_tokens(),
            scip_generator_command: None,
        }
    }
}

fn default_chunk_max_tokens() -> usize {
    256
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).with_context(|| "failed to parse config file")?;

    if config.jobs.max_concurrent_background_jobs == 0 {
        bail!("jobs.max_concurrent_background_jobs must be > 0");
    }
    if config.jobs.max_concurrent_refresh == 0 {
        bail!("jobs.max_concurrent_refresh must be > 0");
    }
    if config.retrieval.content_token_threshold == 0 {
        bail!("retrieval.content_token_threshold must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.base_url.is_none() {
            bail!("embedding.base_url must be specified when embeddings are enabled");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai-compatible" => {}
        other => bail!(
            "unknown embedding provider: '{other}'. Must be disabled or openai-compatible."
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_concurrency() {
        let toml_str = r#"
            [db]
            path = "cidx.sqlite"
            [storage]
            data_dir = "/tmp/cidx"
            [server]
            bind = "0.0.0.0:8080"
            [jobs]
            max_concurrent_background_jobs = 0
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cidxd.toml");
        std::fs::write(&path, toml_str).unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_background_jobs"));
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let toml_str = r#"
            [db]
            path = "cidx.sqlite"
            [storage]
            data_dir = "/tmp/cidx"
            [server]
            bind = "0.0.0.0:8080"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cidxd.toml");
        std::fs::write(&path, toml_str).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.jobs.max_concurrent_background_jobs, 5);
        assert!(!config.embedding.is_enabled());
    }
}
