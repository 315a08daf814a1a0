//! MCP JSON-RPC 2025-06-18 bridge: `initialize`, `tools/list`,
//! `tools/call` over the same Query Engine / Access Control / Repo
//! Manager the REST facade uses.
//!
//! An `rmcp::ServerHandler` wrapping those existing services directly:
//! tool results come back as content-block arrays, and a failed tool
//! call returns its error *inside* a successful `CallToolResult` rather
//! than as a transport-level `McpError`, so a client sees a normal
//! tool-result envelope either way.
//!
//! Every CIDX tool call carries a `session_id` argument (the session
//! minted by `POST /auth/login`) since MCP tool arguments are the one
//! channel guaranteed to reach every call regardless of transport,
//! unlike a bearer header that some MCP clients strip.

use std::borrow::Cow;
use std::sync::Arc;

use cidx_core::error::CidxError;
use cidx_core::model::Permission;
use cidx_core::search::{AggregationMode, ResponseFormat, SearchMode};
use cidx_core::store::{Accuracy, ScipQueryKind, SearchFilters};
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::access::AccessControl;
use crate::ops::Metrics;
use crate::query::{QueryEngine, RepoSelector};
use crate::repo::RepoManager;

#[derive(Clone)]
pub struct McpBridge {
    access: Arc<AccessControl>,
    query: Arc<QueryEngine>,
    repos: Arc<RepoManager>,
    metrics: Arc<Metrics>,
}

impl McpBridge {
    pub fn new(access: Arc<AccessControl>, query: Arc<QueryEngine>, repos: Arc<RepoManager>, metrics: Arc<Metrics>) -> Self {
        Self { access, query, repos, metrics }
    }

    fn tool_list() -> Vec<Tool> {
        let descriptors: &[(&str, &str, Value)] = &[
            (
                "search",
                "Semantic/FTS/hybrid search across one or more golden repositories.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "query": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "mode": {"type": "string", "enum": ["semantic", "fts", "hybrid"]},
                        "limit": {"type": "integer"}
                    },
                    "required": ["session_id", "query", "repository_alias"]
                }),
            ),
            (
                "regex_search",
                "Regex scan over a golden repository's working tree.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "pattern": {"type": "string"},
                        "include": {"type": "array", "items": {"type": "string"}},
                        "exclude": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["session_id", "repository_alias", "pattern"]
                }),
            ),
            (
                "scip_query",
                "SCIP symbol navigation: definition, references, dependencies, dependents, impact, callchain, context.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "kind": {"type": "string", "enum": ["definition","references","dependencies","dependents","impact","callchain","context"]},
                        "symbol": {"type": "string"},
                        "exact": {"type": "boolean"}
                    },
                    "required": ["session_id", "repository_alias", "kind", "symbol"]
                }),
            ),
            (
                "git_log",
                "Recent commits on a golden repository's default branch.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["session_id", "repository_alias"]
                }),
            ),
            (
                "git_show_commit",
                "A commit's message and changed files.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "sha": {"type": "string"}
                    },
                    "required": ["session_id", "repository_alias", "sha"]
                }),
            ),
            (
                "git_diff",
                "Diff two revisions.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "from": {"type": "string"},
                        "to": {"type": "string"}
                    },
                    "required": ["session_id", "repository_alias", "from", "to"]
                }),
            ),
            (
                "git_blame",
                "Per-line blame for a file at HEAD.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "file_path": {"type": "string"}
                    },
                    "required": ["session_id", "repository_alias", "file_path"]
                }),
            ),
            (
                "git_file_history",
                "Commits that touched a file.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "file_path": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["session_id", "repository_alias", "file_path"]
                }),
            ),
            (
                "git_file_at_revision",
                "A file's content at a given revision.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "file_path": {"type": "string"},
                        "sha": {"type": "string"}
                    },
                    "required": ["session_id", "repository_alias", "file_path", "sha"]
                }),
            ),
            (
                "git_search_commits",
                "Commits whose message contains a substring.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "query": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["session_id", "repository_alias", "query"]
                }),
            ),
            (
                "git_search_diffs",
                "Commits whose diff contains a substring.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "repository_alias": {"type": "string"},
                        "query": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["session_id", "repository_alias", "query"]
                }),
            ),
            (
                "get_cached_content",
                "Page through content previously cached behind a search result's cache handle.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": {"type": "string"},
                        "handle": {"type": "string"},
                        "page": {"type": "integer"}
                    },
                    "required": ["session_id", "handle", "page"]
                }),
            ),
        ];

        descriptors
            .iter()
            .map(|(name, description, schema)| {
                let input_schema = match schema {
                    Value::Object(map) => Arc::new(map.clone()),
                    _ => Arc::new(serde_json::Map::new()),
                };
                Tool {
                    name: Cow::Borrowed(*name),
                    title: None,
                    description: Some(Cow::Borrowed(*description)),
                    input_schema,
                    output_schema: None,
                    annotations: Some(ToolAnnotations::new().read_only(true)),
                    execution: None,
                    icons: None,
                    meta: None,
                }
            })
            .collect()
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<Value, CidxError> {
        let session_id = args["session_id"]
            .as_str()
            .ok_or_else(|| CidxError::InvalidInput("missing session_id".to_string()))?;
        let session_id = Uuid::parse_str(session_id).map_err(|_| CidxError::Unauthenticated("malformed session_id".to_string()))?;
        let session = self.access.get_session(session_id).await?;
        let identity = self.access.effective_identity(&session).await?;
        let correlation_id = cidx_core::model::CorrelationId::new();
        let repo_alias = args["repository_alias"].as_str();

        // every MCP tool call is read-only from the server's point of
        // view (mutating golden-repo lifecycle stays REST/admin-only),
        // so the same QueryRepos permission check and audit trail the
        // REST search handler uses applies uniformly here.
        self.access
            .authorize(
                &identity,
                crate::access::MaintenanceState::Normal,
                false,
                Permission::QueryRepos,
                repo_alias,
                name,
                &correlation_id,
            )
            .await?;

        self.metrics.record_tool_call(name);

        match name {
            "search" => {
                let alias = args["repository_alias"].as_str().unwrap_or_default();
                let query_text = args["query"].as_str().unwrap_or_default().to_string();
                let mode = match args["mode"].as_str() {
                    Some("fts") => SearchMode::Fts,
                    Some("hybrid") => SearchMode::Hybrid,
                    _ => SearchMode::Semantic,
                };
                let limit = args["limit"].as_u64().unwrap_or(20) as usize;
                let selector = if alias.contains(',') {
                    RepoSelector::List(alias.split(',').map(|s| s.trim().to_string()).collect())
                } else if alias.contains('*') {
                    RepoSelector::Wildcard(alias.to_string())
                } else {
                    RepoSelector::Single(alias.to_string())
                };
                let request = crate::query::SearchRequest {
                    query_text,
                    repos: selector,
                    mode,
                    filters: SearchFilters {
                        accuracy: Accuracy::Balanced,
                        ..Default::default()
                    },
                    limit,
                    aggregation: AggregationMode::Global,
                    response_format: ResponseFormat::Flat,
                };
                let response = self.query.search(request, &identity, session_id, &correlation_id).await?;
                if let Some(timing) = &response.timing {
                    self.metrics.record_search(Self::mode_label(mode), timing.parallel_ms + timing.merge_ms);
                }
                Ok(serde_json::to_value(response.flat).unwrap_or(json!([])))
            }
            "regex_search" => {
                let alias = args["repository_alias"].as_str().unwrap_or_default();
                let repo = self.repos.get_repository(alias).await?;
                let pattern = args["pattern"].as_str().unwrap_or_default().to_string();
                let include = args["include"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let exclude = args["exclude"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let request = crate::query::regex_search::RegexSearchRequest {
                    pattern,
                    include,
                    exclude,
                    case_sensitive: args["case_sensitive"].as_bool().unwrap_or(false),
                    context_lines: args["context_lines"].as_u64().unwrap_or(2) as usize,
                    limit: args["limit"].as_u64().unwrap_or(100) as usize,
                };
                let matches = crate::query::regex_search::regex_search(repo.clone_path, request).await?;
                Ok(serde_json::to_value(matches).unwrap_or(json!([])))
            }
            "scip_query" => {
                let alias = args["repository_alias"].as_str().unwrap_or_default();
                let kind = match args["kind"].as_str().unwrap_or_default() {
                    "references" => ScipQueryKind::References,
                    "dependencies" => ScipQueryKind::Dependencies,
                    "dependents" => ScipQueryKind::Dependents,
                    "impact" => ScipQueryKind::Impact,
                    "callchain" => ScipQueryKind::CallChain,
                    "context" => ScipQueryKind::Context,
                    _ => ScipQueryKind::Definition,
                };
                let symbol = args["symbol"].as_str().unwrap_or_default();
                let exact = args["exact"].as_bool().unwrap_or(true);
                let limit = args["limit"].as_u64().unwrap_or(50) as usize;
                let records = self.query.scip_query(alias, kind, symbol, exact, limit).await?;
                Ok(serde_json::to_value(records).unwrap_or(json!([])))
            }
            "git_log" | "git_show_commit" | "git_diff" | "git_blame" | "git_file_history" | "git_file_at_revision"
            | "git_search_commits" | "git_search_diffs" => self.dispatch_git(name, &args).await,
            "get_cached_content" => {
                let handle = args["handle"]
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .map(cidx_core::model::CacheHandle)
                    .ok_or_else(|| CidxError::InvalidInput("bad handle".to_string()))?;
                let page = args["page"].as_u64().unwrap_or(1) as usize;
                let result = self.query.get_cached_content(handle, session_id, page)?;
                Ok(serde_json::to_value(result).unwrap_or(json!({})))
            }
            other => Err(CidxError::NotFound(format!("unknown tool '{other}'"))),
        }
    }

    fn mode_label(mode: SearchMode) -> &'static str {
        match mode {
            SearchMode::Semantic => "semantic",
            SearchMode::Fts => "fts",
            SearchMode::Hybrid => "hybrid",
        }
    }

    async fn dispatch_git(&self, name: &str, args: &Value) -> Result<Value, CidxError> {
        let alias = args["repository_alias"].as_str().unwrap_or_default();
        let repo = self.repos.get_repository(alias).await?;
        let explorer = crate::query::git_explorer::GitExplorer::new(repo.clone_path);
        let limit = args["limit"].as_u64().unwrap_or(20) as usize;

        let value = match name {
            "git_log" => serde_json::to_value(explorer.git_log(limit).await?),
            "git_show_commit" => {
                let sha = args["sha"].as_str().unwrap_or_default();
                serde_json::to_value(explorer.git_show_commit(sha).await?)
            }
            "git_diff" => {
                let from = args["from"].as_str().unwrap_or_default();
                let to = args["to"].as_str().unwrap_or_default();
                serde_json::to_value(explorer.git_diff(from, to).await?)
            }
            "git_blame" => {
                let file_path = args["file_path"].as_str().unwrap_or_default();
                serde_json::to_value(explorer.git_blame(file_path).await?)
            }
            "git_file_history" => {
                let file_path = args["file_path"].as_str().unwrap_or_default();
                serde_json::to_value(explorer.git_file_history(file_path, limit).await?)
            }
            "git_file_at_revision" => {
                let file_path = args["file_path"].as_str().unwrap_or_default();
                let sha = args["sha"].as_str().unwrap_or_default();
                serde_json::to_value(explorer.git_file_at_revision(file_path, sha).await?)
            }
            "git_search_commits" => {
                let query = args["query"].as_str().unwrap_or_default();
                serde_json::to_value(explorer.git_search_commits(query, limit).await?)
            }
            "git_search_diffs" => {
                let query = args["query"].as_str().unwrap_or_default();
                serde_json::to_value(explorer.git_search_diffs(query, limit).await?)
            }
            _ => unreachable!(),
        };
        Ok(value.unwrap_or(json!([])))
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "cidx".to_string(),
                title: Some("CIDX Code Intelligence Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Multi-tenant code intelligence over a fleet of golden repositories. \
                 Call `search` for semantic/FTS/hybrid retrieval, `scip_query` for symbol \
                 navigation, `regex_search` for exact pattern scans, and the `git_*` tools \
                 for commit history. Every call requires a `session_id` from /auth/login."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::tool_list())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        Self::tool_list().into_iter().find(|t| t.name == name)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match self.dispatch(&request.name, args).await {
            Ok(value) => {
                // empty results render as an empty JSON array/object, never
                // null.
                let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| "[]".to_string());
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_list_is_never_empty_and_all_names_unique() {
        let tools = McpBridge::tool_list();
        assert!(!tools.is_empty());
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), tools.len());
    }
}
