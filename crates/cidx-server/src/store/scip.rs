//! Per-repo `ScipIndex`: a symbol graph built from SCIP protobuf index
//! files, queried for definitions/references/dependencies/dependents
//! /impact/call chains.
//!
//! The graph shape (`petgraph::DiGraph` of symbol nodes, typed edges for
//! calls/imports/inheritance) is grounded on
//! `codegraph_ir::features::cross_file::symbol_graph::SymbolEdgeKind` —
//! CIDX narrows that general IR to the relationships SCIP actually
//! encodes. `prost` decodes the `.scip` protobuf emitted by the external
//! per-language SCIP generator.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::store::{ScipIndex, ScipQueryKind, ScipRecord};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolEdgeKind {
    Calls,
    Imports,
    Inherits,
}

#[derive(Debug, Clone)]
struct SymbolNode {
    symbol: String,
    project: String,
    file: String,
    line: u32,
    column: u32,
    kind: String,
}

/// A decoded SCIP occurrence, the unit `prost` deserializes from the
/// `.scip` protobuf before it is folded into the graph.
#[derive(Debug, Clone, prost::Message)]
pub struct ScipOccurrence {
    #[prost(string, tag = "1")]
    pub symbol: String,
    #[prost(string, tag = "2")]
    pub file: String,
    #[prost(uint32, tag = "3")]
    pub line: u32,
    #[prost(uint32, tag = "4")]
    pub column: u32,
    #[prost(string, tag = "5")]
    pub kind: String,
    #[prost(string, optional, tag = "6")]
    pub calls: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub imports: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub inherits: Option<String>,
}

pub struct PetgraphScipIndex {
    project: String,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    graph: DiGraph<SymbolNode, SymbolEdgeKind>,
    by_symbol: HashMap<String, NodeIndex>,
}

impl PetgraphScipIndex {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    fn node_for(&self, inner: &mut Inner, symbol: &str, project: &str, file: &str, line: u32, column: u32, kind: &str) -> NodeIndex {
        if let Some(idx) = inner.by_symbol.get(symbol) {
            return *idx;
        }
        let idx = inner.graph.add_node(SymbolNode {
            symbol: symbol.to_string(),
            project: project.to_string(),
            file: file.to_string(),
            line,
            column,
            kind: kind.to_string(),
        });
        inner.by_symbol.insert(symbol.to_string(), idx);
        idx
    }

    /// Decodes a `.scip` protobuf file and folds its occurrences into
    /// the graph, deleting the intermediate file on success.
    pub async fn import_scip_file(&self, path: PathBuf) -> CidxResult<()> {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| CidxError::ExternalFailure(format!("failed to read SCIP file: {e}")))?;
        let occurrences = decode_occurrences(&bytes)?;

        {
            let mut inner = self.inner.write();
            for occurrence in &occurrences {
                let from = self.node_for(
                    &mut inner,
                    &occurrence.symbol,
                    &self.project,
                    &occurrence.file,
                    occurrence.line,
                    occurrence.column,
                    &occurrence.kind,
                );
                if let Some(target) = &occurrence.calls {
                    let to = self.node_for(&mut inner, target, &self.project, "", 0, 0, "symbol");
                    inner.graph.add_edge(from, to, SymbolEdgeKind::Calls);
                }
                if let Some(target) = &occurrence.imports {
                    let to = self.node_for(&mut inner, target, &self.project, "", 0, 0, "symbol");
                    inner.graph.add_edge(from, to, SymbolEdgeKind::Imports);
                }
                if let Some(target) = &occurrence.inherits {
                    let to = self.node_for(&mut inner, target, &self.project, "", 0, 0, "symbol");
                    inner.graph.add_edge(from, to, SymbolEdgeKind::Inherits);
                }
            }
        }

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }
}

fn decode_occurrences(bytes: &[u8]) -> CidxResult<Vec<ScipOccurrence>> {
    // Each occurrence is length-delimited (one `prost::Message::decode_length_delimited`
    // frame per record), matching a streaming SCIP-index encoding.
    let mut occurrences = Vec::new();
    let mut cursor = bytes;
    while !cursor.is_empty() {
        let occurrence = prost::Message::decode_length_delimited(&mut cursor)
            .map_err(|e| CidxError::IntegrityFailure(format!("corrupt SCIP stream: {e}")))?;
        occurrences.push(occurrence);
    }
    Ok(occurrences)
}

fn record_of(node: &SymbolNode, relationship: Option<&str>) -> ScipRecord {
    ScipRecord {
        symbol: node.symbol.clone(),
        project: node.project.clone(),
        file: node.file.clone(),
        line: node.line,
        column: node.column,
        kind: node.kind.clone(),
        relationship: relationship.map(str::to_string),
        context: None,
    }
}

fn matches_query(symbol: &str, query: &str, exact: bool) -> bool {
    if exact {
        symbol == query
    } else {
        symbol.contains(query)
    }
}

#[async_trait]
impl ScipIndex for PetgraphScipIndex {
    async fn query(
        &self,
        kind: ScipQueryKind,
        symbol_or_position: &str,
        exact: bool,
        limit: usize,
    ) -> CidxResult<Vec<ScipRecord>> {
        let inner = self.inner.read();
        let matches: Vec<NodeIndex> = inner
            .by_symbol
            .iter()
            .filter(|(s, _)| matches_query(s, symbol_or_position, exact))
            .map(|(_, idx)| *idx)
            .collect();

        if matches.is_empty() {
            return Err(CidxError::NotFound(format!(
                "no symbol matching '{symbol_or_position}'"
            )));
        }

        let mut out = Vec::new();
        for idx in matches {
            let node = &inner.graph[idx];
            match kind {
                ScipQueryKind::Definition | ScipQueryKind::Context => {
                    out.push(record_of(node, None));
                }
                ScipQueryKind::References => {
                    for edge in inner.graph.edges_directed(idx, Direction::Incoming) {
                        if *edge.weight() == SymbolEdgeKind::Calls {
                            out.push(record_of(&inner.graph[edge.source()], Some("calls")));
                        }
                    }
                }
                ScipQueryKind::Dependencies => {
                    for edge in inner.graph.edges_directed(idx, Direction::Outgoing) {
                        out.push(record_of(&inner.graph[edge.target()], Some(edge_label(*edge.weight()))));
                    }
                }
                ScipQueryKind::Dependents => {
                    for edge in inner.graph.edges_directed(idx, Direction::Incoming) {
                        out.push(record_of(&inner.graph[edge.source()], Some(edge_label(*edge.weight()))));
                    }
                }
                ScipQueryKind::Impact => {
                    out.extend(transitive_closure(&inner, idx, Direction::Incoming));
                }
                ScipQueryKind::CallChain => {
                    out.extend(transitive_closure(&inner, idx, Direction::Outgoing));
                }
            }
        }
        out.truncate(limit);
        Ok(out)
    }
}

fn edge_label(kind: SymbolEdgeKind) -> &'static str {
    match kind {
        SymbolEdgeKind::Calls => "calls",
        SymbolEdgeKind::Imports => "imports",
        SymbolEdgeKind::Inherits => "inherits",
    }
}

/// BFS over the chosen direction, bounding depth implicitly by never
/// revisiting a node — used for `impact` (who transitively depends on
/// this symbol) and `callchain` (what this symbol transitively calls).
fn transitive_closure(inner: &Inner, start: NodeIndex, direction: Direction) -> Vec<ScipRecord> {
    let mut visited = std::collections::HashSet::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(start);
    visited.insert(start);

    let mut out = Vec::new();
    while let Some(current) = queue.pop_front() {
        for edge in inner.graph.edges_directed(current, direction) {
            let next = match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            };
            if visited.insert(next) {
                out.push(record_of(&inner.graph[next], Some(edge_label(*edge.weight()))));
                queue.push_back(next);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_query_requires_full_match() {
        let index = PetgraphScipIndex::new("demo");
        {
            let mut inner = index.inner.write();
            index.node_for(&mut inner, "pkg.Foo", "demo", "foo.rs", 1, 1, "struct");
        }
        assert!(matches_query("pkg.Foo", "pkg.Foo", true));
        assert!(!matches_query("pkg.Foo", "Foo", true));
        assert!(matches_query("pkg.Foo", "Foo", false));
    }

    #[tokio::test]
    async fn dependencies_follow_calls_edge() {
        let index = PetgraphScipIndex::new("demo");
        {
            let mut inner = index.inner.write();
            let a = index.node_for(&mut inner, "a", "demo", "a.rs", 1, 1, "fn");
            let b = index.node_for(&mut inner, "b", "demo", "b.rs", 1, 1, "fn");
            inner.graph.add_edge(a, b, SymbolEdgeKind::Calls);
        }
        let deps = index
            .query(ScipQueryKind::Dependencies, "a", true, 10)
            .await
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].symbol, "b");
    }
}
