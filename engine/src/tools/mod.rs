//! Tool Orchestrator
//!
//! Builds a name-keyed catalog from every configured [`ToolBackend`] and
//! routes tool calls to the backend that declared the tool. A tool name
//! declared by more than one backend is a collision: strict catalogs
//! refuse to load, lenient ones keep the name unresolvable and answer
//! calls to it with a conflict error.
//!
//! Every call goes through [`ToolOrchestrator::execute`], which never
//! fails as a Rust error; all outcomes come back as a
//! [`ToolExecutionResponse`] correlated by the original `tool_call_id`.

pub mod http;

pub use http::HttpToolBackend;

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sdk::backend::{BackendError, ToolBackend};
use sdk::errors::EngineError;
use sdk::harmony::{ToolCall, ToolSpec};
use sdk::types::{ToolExecutionResponse, ToolFailureKind};

use crate::config::Config;
use crate::harmony::is_valid_tool_name;
use crate::secrets::{scrub, SecretCache};

/// Reachability of one backend
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendStatus {
    pub id: String,
    pub reachable: bool,
    pub tools: usize,
}

#[derive(Default)]
struct Catalog {
    /// Unambiguous tools by name
    tools: HashMap<String, ToolSpec>,
    /// Colliding names and every declaration of them
    conflicts: HashMap<String, Vec<ToolSpec>>,
    /// Backends that failed to list tools at the last load
    unreachable: HashSet<String>,
}

/// Routes tool calls to their backends
pub struct ToolOrchestrator {
    backends: Vec<Arc<dyn ToolBackend>>,
    catalog: RwLock<Catalog>,
    call_timeout: Duration,
    strict: bool,
}

impl ToolOrchestrator {
    /// Query every backend and build the catalog.
    ///
    /// # Errors
    /// `Conflict` when `strict` is set and two backends declare the same
    /// tool name. Unreachable backends never fail the load.
    pub async fn load(
        backends: Vec<Arc<dyn ToolBackend>>,
        call_timeout: Duration,
        strict: bool,
    ) -> Result<Self, EngineError> {
        let orchestrator = Self {
            backends,
            catalog: RwLock::new(Catalog::default()),
            call_timeout,
            strict,
        };
        orchestrator.refresh().await?;
        Ok(orchestrator)
    }

    /// Build HTTP backends from config and load the catalog
    pub async fn from_config(config: &Config, secrets: &SecretCache) -> Result<Self, EngineError> {
        let mut backends: Vec<Arc<dyn ToolBackend>> = Vec::new();
        for backend in &config.tools.backends {
            let api_key = secrets.get_opt(backend.api_key_env.as_deref())?;
            backends.push(Arc::new(HttpToolBackend::new(
                &backend.id,
                &backend.base_url,
                api_key,
            )?));
        }
        Self::load(backends, config.tools.call_timeout(), config.tools.strict_catalog).await
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Re-query every backend and swap in the new catalog.
    ///
    /// On a strict-mode collision the previous catalog stays in place.
    /// Returns the number of resolvable tools.
    pub async fn refresh(&self) -> Result<usize, EngineError> {
        let listings = join_all(self.backends.iter().map(|backend| async move {
            let listing = tokio::time::timeout(self.call_timeout, backend.list_tools()).await;
            (backend.id().to_string(), listing)
        }))
        .await;

        let mut declared: BTreeMap<String, Vec<ToolSpec>> = BTreeMap::new();
        let mut unreachable = HashSet::new();

        for (backend_id, listing) in listings {
            let specs = match listing {
                Ok(Ok(specs)) => specs,
                Ok(Err(e)) => {
                    tracing::warn!(backend = %backend_id, "Tool backend unavailable: {}", e);
                    unreachable.insert(backend_id);
                    continue;
                }
                Err(_) => {
                    tracing::warn!(backend = %backend_id, "Tool backend timed out listing tools");
                    unreachable.insert(backend_id);
                    continue;
                }
            };

            let mut own = HashSet::new();
            for mut spec in specs {
                if !is_valid_tool_name(&spec.name) {
                    tracing::warn!(backend = %backend_id, tool = %spec.name, "Skipping tool with invalid name");
                    continue;
                }
                if !own.insert(spec.name.clone()) {
                    tracing::warn!(backend = %backend_id, tool = %spec.name, "Backend declares tool twice");
                    continue;
                }
                spec.backend = backend_id.clone();
                declared.entry(spec.name.clone()).or_default().push(spec);
            }
        }

        let mut catalog = Catalog {
            unreachable,
            ..Catalog::default()
        };
        for (name, mut specs) in declared {
            if specs.len() == 1 {
                if let Some(spec) = specs.pop() {
                    catalog.tools.insert(name, spec);
                }
            } else {
                let owners: Vec<&str> = specs.iter().map(|s| s.backend.as_str()).collect();
                if self.strict {
                    return Err(EngineError::Conflict(format!(
                        "tool '{}' is declared by multiple backends: {}",
                        name,
                        owners.join(", ")
                    )));
                }
                tracing::warn!(tool = %name, owners = ?owners, "Tool name collision; calls to it will fail");
                catalog.conflicts.insert(name, specs);
            }
        }

        let size = catalog.tools.len();
        tracing::info!(
            tools = size,
            backends = self.backends.len(),
            unreachable = catalog.unreachable.len(),
            "Tool catalog loaded"
        );
        *self.catalog.write().unwrap_or_else(|p| p.into_inner()) = catalog;
        Ok(size)
    }

    /// Every resolvable tool, ordered by name
    pub fn get_all_tools(&self) -> Vec<ToolSpec> {
        let mut tools: Vec<ToolSpec> = self.read().tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Every tool a backend declared, colliding ones included
    pub fn get_tools_by_client(&self, backend_id: &str) -> Result<Vec<ToolSpec>, EngineError> {
        if !self.backends.iter().any(|b| b.id() == backend_id) {
            return Err(EngineError::NotFound(format!("tool backend '{}'", backend_id)));
        }

        let catalog = self.read();
        let mut tools: Vec<ToolSpec> = catalog
            .tools
            .values()
            .chain(catalog.conflicts.values().flatten())
            .filter(|spec| spec.backend == backend_id)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolSpec> {
        self.read().tools.get(name).cloned()
    }

    /// Number of resolvable tools
    pub fn catalog_size(&self) -> usize {
        self.read().tools.len()
    }

    /// Rank tools against `query`.
    ///
    /// Case-insensitive substring matches over name and description come
    /// first, then tools whose name contains the query as a subsequence.
    /// An empty query returns every tool.
    pub fn search_tools(&self, query: &str) -> Vec<ToolSpec> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.get_all_tools();
        }

        let mut scored: Vec<(u32, ToolSpec)> = self
            .read()
            .tools
            .values()
            .filter_map(|spec| score(spec, &query).map(|s| (s, spec.clone())))
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| a.name.cmp(&b.name)));
        scored.into_iter().map(|(_, spec)| spec).collect()
    }

    /// Execute one tool call.
    pub async fn execute(&self, call: &ToolCall) -> ToolExecutionResponse {
        let resolved = {
            let catalog = self.read();
            if let Some(specs) = catalog.conflicts.get(&call.name) {
                let owners: Vec<&str> = specs.iter().map(|s| s.backend.as_str()).collect();
                Err(ToolExecutionResponse::failed(
                    &call.id,
                    ToolFailureKind::Conflict,
                    format!("tool '{}' is ambiguous: declared by {}", call.name, owners.join(", ")),
                ))
            } else if let Some(spec) = catalog.tools.get(&call.name) {
                Ok(spec.backend.clone())
            } else {
                Err(ToolExecutionResponse::failed(
                    &call.id,
                    ToolFailureKind::NotFound,
                    format!("unknown tool '{}'", call.name),
                ))
            }
        };

        let backend_id = match resolved {
            Ok(id) => id,
            Err(response) => {
                tracing::debug!(tool = %call.name, tool_call_id = %call.id, "Tool not resolvable");
                return response;
            }
        };

        let Some(backend) = self.backends.iter().find(|b| b.id() == backend_id) else {
            return ToolExecutionResponse::failed(
                &call.id,
                ToolFailureKind::NotFound,
                format!("backend '{}' is not configured", backend_id),
            );
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.call_timeout, backend.call_tool(call)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let response = match outcome {
            Ok(Ok(result)) => ToolExecutionResponse::ok(&call.id, result),
            Err(_) => ToolExecutionResponse::failed(
                &call.id,
                ToolFailureKind::Timeout,
                format!("tool '{}' did not answer within {}s", call.name, self.call_timeout.as_secs_f64()),
            ),
            Ok(Err(e)) => {
                let kind = match &e {
                    BackendError::Unreachable(_) => ToolFailureKind::Unreachable,
                    BackendError::Timeout => ToolFailureKind::Timeout,
                    BackendError::InvalidRequest(_) => ToolFailureKind::Validation,
                    BackendError::Application(_) | BackendError::Protocol(_) => {
                        ToolFailureKind::Application
                    }
                };
                ToolExecutionResponse::failed(&call.id, kind, scrub(&e.to_string()))
            }
        };

        match &response.error {
            None => tracing::info!(tool = %call.name, backend = %backend_id, elapsed_ms, "Tool call succeeded"),
            Some(err) => tracing::warn!(tool = %call.name, backend = %backend_id, elapsed_ms, "Tool call failed: {}", err),
        }

        response
    }

    /// Probe every backend concurrently
    pub async fn get_client_status(&self) -> Vec<BackendStatus> {
        let probes = join_all(self.backends.iter().map(|backend| async move {
            let reachable = tokio::time::timeout(self.call_timeout, backend.health())
                .await
                .unwrap_or(false);
            (backend.id().to_string(), reachable)
        }))
        .await;

        let catalog = self.read();
        probes
            .into_iter()
            .map(|(id, reachable)| {
                let tools = catalog
                    .tools
                    .values()
                    .chain(catalog.conflicts.values().flatten())
                    .filter(|spec| spec.backend == id)
                    .count();
                BackendStatus { id, reachable, tools }
            })
            .collect()
    }

    /// Backends that could not be listed at the last load
    pub fn unreachable_backends(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().unreachable.iter().cloned().collect();
        ids.sort();
        ids
    }
}

fn score(spec: &ToolSpec, query: &str) -> Option<u32> {
    let name = spec.name.to_lowercase();
    if name == query {
        return Some(100);
    }
    if name.starts_with(query) {
        return Some(80);
    }
    if name.contains(query) {
        return Some(60);
    }
    if spec.description.to_lowercase().contains(query) {
        return Some(40);
    }
    if is_subsequence(query, &name) {
        return Some(20);
    }
    None
}

fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut chars = haystack.chars();
    needle.chars().all(|c| chars.any(|h| h == c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    struct StaticBackend {
        id: String,
        tools: Vec<&'static str>,
        fail_list: bool,
        delay: Duration,
    }

    impl StaticBackend {
        fn new(id: &str, tools: Vec<&'static str>) -> Arc<dyn ToolBackend> {
            Arc::new(Self {
                id: id.to_string(),
                tools,
                fail_list: false,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl ToolBackend for StaticBackend {
        fn id(&self) -> &str {
            &self.id
        }

        async fn list_tools(&self) -> Result<Vec<ToolSpec>, BackendError> {
            if self.fail_list {
                return Err(BackendError::Unreachable("connection refused".into()));
            }
            Ok(self
                .tools
                .iter()
                .map(|name| ToolSpec {
                    name: name.to_string(),
                    description: format!("{} tool", name.replace('_', " ")),
                    parameters: json!({ "type": "object" }),
                    backend: String::new(),
                })
                .collect())
        }

        async fn call_tool(&self, call: &ToolCall) -> Result<Value, BackendError> {
            tokio::time::sleep(self.delay).await;
            match call.name.as_str() {
                "fail" => Err(BackendError::Application("boom".into())),
                "bad_args" => Err(BackendError::InvalidRequest("missing q".into())),
                _ => Ok(json!({ "backend": self.id, "args": call.arguments })),
            }
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall::new(id, name, Map::new())
    }

    #[tokio::test]
    async fn test_catalog_and_lookup() {
        let tools = ToolOrchestrator::load(
            vec![
                StaticBackend::new("web", vec!["search_web", "fetch_url"]),
                StaticBackend::new("fs", vec!["read_file"]),
            ],
            Duration::from_secs(1),
            true,
        )
        .await
        .unwrap();

        assert_eq!(tools.catalog_size(), 3);
        assert_eq!(tools.get_tool("read_file").unwrap().backend, "fs");
        let names: Vec<String> = tools.get_all_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["fetch_url", "read_file", "search_web"]);
        assert_eq!(tools.get_tools_by_client("web").unwrap().len(), 2);
        assert!(matches!(
            tools.get_tools_by_client("nope"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_strict_collision_fails_load() {
        let result = ToolOrchestrator::load(
            vec![
                StaticBackend::new("a", vec!["search_web"]),
                StaticBackend::new("b", vec!["search_web"]),
            ],
            Duration::from_secs(1),
            true,
        )
        .await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_lenient_collision_yields_conflict_result() {
        let tools = ToolOrchestrator::load(
            vec![
                StaticBackend::new("a", vec!["search_web", "only_a"]),
                StaticBackend::new("b", vec!["search_web"]),
            ],
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap();

        assert_eq!(tools.catalog_size(), 1);
        assert!(tools.get_tool("search_web").is_none());
        assert_eq!(tools.get_tools_by_client("b").unwrap().len(), 1);

        let response = tools.execute(&call("tc1", "search_web")).await;
        assert!(!response.success);
        assert_eq!(response.tool_call_id, "tc1");
        assert_eq!(response.error.unwrap().kind, ToolFailureKind::Conflict);
    }

    #[tokio::test]
    async fn test_unreachable_backend_does_not_fail_load() {
        let down: Arc<dyn ToolBackend> = Arc::new(StaticBackend {
            id: "down".to_string(),
            tools: vec!["never"],
            fail_list: true,
            delay: Duration::ZERO,
        });
        let tools = ToolOrchestrator::load(
            vec![down, StaticBackend::new("up", vec!["search_web"])],
            Duration::from_secs(1),
            true,
        )
        .await
        .unwrap();

        assert_eq!(tools.catalog_size(), 1);
        assert_eq!(tools.unreachable_backends(), vec!["down".to_string()]);
        let status = tools.get_client_status().await;
        let down = status.iter().find(|s| s.id == "down").unwrap();
        assert!(!down.reachable);
        assert_eq!(down.tools, 0);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let tools = ToolOrchestrator::load(vec![], Duration::from_secs(1), true)
            .await
            .unwrap();
        let response = tools.execute(&call("tc-x", "does_not_exist")).await;
        assert!(!response.success);
        assert_eq!(response.tool_call_id, "tc-x");
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().kind, ToolFailureKind::NotFound);
    }

    #[tokio::test]
    async fn test_execute_maps_backend_errors() {
        let tools = ToolOrchestrator::load(
            vec![StaticBackend::new("b", vec!["fail", "bad_args", "ok_tool"])],
            Duration::from_secs(1),
            true,
        )
        .await
        .unwrap();

        let ok = tools.execute(&call("1", "ok_tool")).await;
        assert!(ok.success);
        assert_eq!(ok.result.unwrap()["backend"], "b");

        let app = tools.execute(&call("2", "fail")).await;
        assert_eq!(app.error.unwrap().kind, ToolFailureKind::Application);

        let validation = tools.execute(&call("3", "bad_args")).await;
        assert_eq!(validation.error.unwrap().kind, ToolFailureKind::Validation);
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let slow: Arc<dyn ToolBackend> = Arc::new(StaticBackend {
            id: "slow".to_string(),
            tools: vec!["sleepy"],
            fail_list: false,
            delay: Duration::from_millis(500),
        });
        let tools = ToolOrchestrator::load(vec![slow], Duration::from_millis(50), true)
            .await
            .unwrap();

        let response = tools.execute(&call("t", "sleepy")).await;
        assert_eq!(response.tool_call_id, "t");
        assert_eq!(response.error.unwrap().kind, ToolFailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_search_ranking() {
        let tools = ToolOrchestrator::load(
            vec![StaticBackend::new(
                "b",
                vec!["search_web", "web_fetch", "read_file", "search"],
            )],
            Duration::from_secs(1),
            true,
        )
        .await
        .unwrap();

        let names = |q: &str| -> Vec<String> {
            tools.search_tools(q).into_iter().map(|t| t.name).collect()
        };

        assert_eq!(names("search"), vec!["search", "search_web"]);
        assert_eq!(names("WEB"), vec!["web_fetch", "search_web"]);
        // subsequence on name
        assert_eq!(names("rdfl"), vec!["read_file"]);
        // description only ("read file tool")
        assert_eq!(names("file tool"), vec!["read_file"]);
        assert!(names("zzz").is_empty());
        assert_eq!(names("").len(), 4);
    }
}
