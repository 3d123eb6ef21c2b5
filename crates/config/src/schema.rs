/// Config file schema.
use std::path::PathBuf;

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

pub const DEFAULT_AGENT_ID: &str = "default";

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    /// Agent whose memory the CLI operates on.
    pub agent_id: String,

    /// Workspace holding `MEMORY.md` and `memory/`. Defaults to the current directory.
    pub workspace: Option<PathBuf>,

    /// Memory settings, passed through untouched. Keys may be snake_case or
    /// camelCase; validation happens when a manager is opened.
    pub memory: Map<String, Value>,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            agent_id: DEFAULT_AGENT_ID.into(),
            workspace: None,
            memory: Map::new(),
        }
    }
}

impl RecallConfig {
    pub fn memory_settings(&self) -> Value {
        Value::Object(self.memory.clone())
    }

    pub fn workspace_or_cwd(&self) -> std::io::Result<PathBuf> {
        match &self.workspace {
            Some(path) => Ok(path.clone()),
            None => std::env::current_dir(),
        }
    }
}
