//! Aggregated tool registry and router
//!
//! Maintains the per-server catalogs, the flat routing namespace and the
//! BM25 snapshot. Within the proxy a tool is identified as
//! `"<server>.<name>"`; the short form is accepted while it is unambiguous.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use mcpproxy_mcp::Tool;
use serde::Serialize;
use tracing::debug;

use crate::bm25::{Bm25Index, ScoredTool};
use crate::error::{IndexError, IndexResult};

/// A tool together with the server that owns it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedTool {
    pub server: String,

    #[serde(flatten)]
    pub tool: Tool,
}

impl IndexedTool {
    /// Qualified name used in the flat namespace
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server, self.tool.name)
    }
}

#[derive(Default)]
struct RegistryState {
    /// Server name to its current catalog
    catalogs: HashMap<String, Vec<Tool>>,
}

/// The registry. Searches read a copy-on-write index snapshot; catalog
/// updates rebuild the snapshot and swap it atomically.
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    index: RwLock<Arc<Bm25Index>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            index: RwLock::new(Arc::new(Bm25Index::build(std::iter::empty::<(
                &str,
                String,
            )>()))),
        }
    }

    /// Replace a server's catalog and rebuild the index snapshot
    pub fn update_server(&self, server: &str, tools: Vec<Tool>) {
        {
            let mut state = self.state.write().expect("registry poisoned");
            state.catalogs.insert(server.to_string(), tools);
        }
        self.rebuild();
        debug!(server = %server, "catalog committed to index");
    }

    /// Drop a server's catalog entirely
    pub fn remove_server(&self, server: &str) {
        let removed = {
            let mut state = self.state.write().expect("registry poisoned");
            state.catalogs.remove(server).is_some()
        };
        if removed {
            self.rebuild();
        }
    }

    /// Number of tools a server currently exposes
    pub fn tool_count(&self, server: &str) -> usize {
        self.state
            .read()
            .expect("registry poisoned")
            .catalogs
            .get(server)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Every tool in the aggregated catalog
    pub fn all_tools(&self) -> Vec<IndexedTool> {
        let state = self.state.read().expect("registry poisoned");
        let mut tools: Vec<IndexedTool> = state
            .catalogs
            .iter()
            .flat_map(|(server, catalog)| {
                catalog.iter().map(|tool| IndexedTool {
                    server: server.clone(),
                    tool: tool.clone(),
                })
            })
            .collect();
        tools.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
        tools
    }

    /// Resolve a tool reference to `(server, upstream tool name)`.
    ///
    /// Qualified names split on the first `.`; short names work only while
    /// exactly one server exposes them.
    pub fn resolve(&self, reference: &str) -> IndexResult<(String, String)> {
        let state = self.state.read().expect("registry poisoned");

        if let Some((server, tool_name)) = reference.split_once('.') {
            if let Some(catalog) = state.catalogs.get(server) {
                if catalog.iter().any(|t| t.name == tool_name) {
                    return Ok((server.to_string(), tool_name.to_string()));
                }
            }
            // fall through: the dot may be part of an unqualified name
        }

        let mut owners: Vec<String> = state
            .catalogs
            .iter()
            .filter(|(_, catalog)| catalog.iter().any(|t| t.name == reference))
            .map(|(server, _)| server.clone())
            .collect();
        owners.sort();

        match owners.len() {
            0 => Err(IndexError::ToolNotFound {
                name: reference.to_string(),
            }),
            1 => Ok((owners.remove(0), reference.to_string())),
            _ => Err(IndexError::AmbiguousTool {
                name: reference.to_string(),
                servers: owners,
            }),
        }
    }

    /// BM25 search over the current snapshot
    pub fn search(&self, query: &str, limit: usize) -> Vec<ScoredTool> {
        let snapshot = self.index.read().expect("registry poisoned").clone();
        snapshot.search(query, limit)
    }

    /// Look up a tool by qualified name
    pub fn get(&self, qualified_name: &str) -> Option<IndexedTool> {
        let (server, tool_name) = qualified_name.split_once('.')?;
        let state = self.state.read().expect("registry poisoned");
        state.catalogs.get(server).and_then(|catalog| {
            catalog
                .iter()
                .find(|t| t.name == tool_name)
                .map(|tool| IndexedTool {
                    server: server.to_string(),
                    tool: tool.clone(),
                })
        })
    }

    /// Rebuild the BM25 snapshot from the current catalogs and swap it in
    fn rebuild(&self) {
        let corpus: Vec<(String, String)> = {
            let state = self.state.read().expect("registry poisoned");
            state
                .catalogs
                .iter()
                .flat_map(|(server, catalog)| {
                    catalog.iter().map(move |tool| {
                        let schema_text = schema_to_text(&tool.input_schema);
                        (
                            format!("{}.{}", server, tool.name),
                            format!(
                                "{} {} {} {}",
                                tool.name.replace('_', " "),
                                tool.description,
                                server,
                                schema_text
                            ),
                        )
                    })
                })
                .collect()
        };

        let index = Bm25Index::build(corpus.iter().map(|(name, text)| (name.as_str(), text.clone())));
        *self.index.write().expect("registry poisoned") = Arc::new(index);
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Flatten a JSON schema into searchable text: property names,
/// descriptions and enum values
fn schema_to_text(schema: &serde_json::Value) -> String {
    let mut parts = Vec::new();
    collect_schema_text(schema, &mut parts);
    parts.join(" ")
}

fn collect_schema_text(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map {
                if key == "properties" {
                    if let Some(props) = entry.as_object() {
                        out.extend(props.keys().cloned());
                    }
                }
                if key == "description" || key == "title" {
                    if let Some(text) = entry.as_str() {
                        out.push(text.to_string());
                    }
                }
                collect_schema_text(entry, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_schema_text(item, out);
            }
        }
        _ => {}
    }
}
