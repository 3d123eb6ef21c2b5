/// Agent-callable tools over a memory manager.
use std::sync::Arc;

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    serde_json::{Value, json},
};

use crate::{manager::MemoryManager, search::SearchOptions};

const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 50;

/// Agent-callable tool.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value) -> Result<Value>;
}

/// `memory_search` and `memory_get` bound to one manager.
pub fn memory_tools(manager: Arc<MemoryManager>) -> Vec<Box<dyn AgentTool>> {
    vec![
        Box::new(MemorySearchTool::new(Arc::clone(&manager))),
        Box::new(MemoryGetTool::new(manager)),
    ]
}

pub struct MemorySearchTool {
    manager: Arc<MemoryManager>,
}

impl MemorySearchTool {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AgentTool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory notes. Returns the best matching snippets with their chunk ids."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "k": { "type": "integer", "minimum": 1, "maximum": MAX_LIMIT },
                "weight": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 1,
                    "description": "1 = meaning only, 0 = exact words only"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .context("missing 'query' parameter")?;
        let limit = params
            .get("k")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_LIMIT, |k| (k as usize).clamp(1, MAX_LIMIT));
        let weight = params
            .get("weight")
            .and_then(Value::as_f64)
            .map(|w| w as f32);

        let response = self
            .manager
            .search(query, SearchOptions {
                limit,
                weight,
                min_score: None,
            })
            .await?;
        let results: Vec<Value> = response
            .hits
            .iter()
            .map(|h| {
                json!({
                    "id": h.id,
                    "path": h.source_path,
                    "start_line": h.start_line,
                    "end_line": h.end_line,
                    "score": h.score,
                    "text": h.text,
                })
            })
            .collect();
        Ok(json!({
            "results": results,
            "mode": response.mode,
            "degraded": response.degraded,
        }))
    }
}

pub struct MemoryGetTool {
    manager: Arc<MemoryManager>,
}

impl MemoryGetTool {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AgentTool for MemoryGetTool {
    fn name(&self) -> &str {
        "memory_get"
    }

    fn description(&self) -> &str {
        "Fetch the full text of a memory chunk by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Chunk id from memory_search" }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let id = params
            .get("id")
            .and_then(Value::as_str)
            .context("missing 'id' parameter")?;
        let chunk = self.manager.get(id).await?;
        Ok(json!({
            "id": chunk.id,
            "path": chunk.source_path,
            "start_line": chunk.start_line,
            "end_line": chunk.end_line,
            "text": chunk.text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::MemorySettings, embeddings::ResolvedProvider, sync::SyncOptions};

    #[tokio::test]
    async fn search_then_get() {
        let ws = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("MEMORY.md"), "User prefers dark roast coffee.\n").unwrap();
        let settings = MemorySettings {
            store_path: Some(data.path().join("m.sqlite")),
            ..Default::default()
        };
        let manager = MemoryManager::open("a", ws.path(), settings, ResolvedProvider::disabled())
            .await
            .unwrap();
        manager.sync(SyncOptions::default()).await.unwrap();

        let tools = memory_tools(manager);
        let search = tools.iter().find(|t| t.name() == "memory_search").unwrap();
        let get = tools.iter().find(|t| t.name() == "memory_get").unwrap();

        let found = search.execute(json!({ "query": "coffee", "k": 3 })).await.unwrap();
        let results = found["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["path"], "MEMORY.md");
        assert_eq!(found["mode"], "keyword");

        let id = results[0]["id"].as_str().unwrap();
        let chunk = get.execute(json!({ "id": id })).await.unwrap();
        assert!(chunk["text"].as_str().unwrap().contains("dark roast"));

        assert!(search.execute(json!({})).await.is_err());
        assert!(get.execute(json!({ "id": "missing" })).await.is_err());
    }
}
