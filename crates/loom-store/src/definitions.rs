use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use futures::future::BoxFuture;
use tracing::debug;

use loom_core::error::{LoomError, Result};
use loom_core::traits::DefinitionStore;
use loom_core::workflow::WorkflowDefinition;

/// Loads `{dir}/{id}.json` or `{dir}/{id}.toml`, JSON first.
pub struct FileDefinitionStore {
    dir: PathBuf,
}

impl FileDefinitionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parse a definition file by extension.
    pub fn parse_file(path: &Path) -> Result<WorkflowDefinition> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| LoomError::Validation(format!("{}: {}", path.display(), e))),
            _ => serde_json::from_str(&content)
                .map_err(|e| LoomError::Validation(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn load(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(LoomError::Validation(format!("invalid workflow id: {id}")));
        }
        for ext in ["json", "toml"] {
            let path = self.dir.join(format!("{id}.{ext}"));
            if !path.exists() {
                continue;
            }
            let def = Self::parse_file(&path)?;
            if def.id != id {
                return Err(LoomError::Validation(format!(
                    "{} declares id {} but was requested as {}",
                    path.display(),
                    def.id,
                    id
                )));
            }
            debug!(path = %path.display(), "Loaded workflow definition");
            return Ok(Some(def));
        }
        Ok(None)
    }

    /// Ids of every definition file in the directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml")))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl DefinitionStore for FileDefinitionStore {
    fn load_workflow_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let id = id.to_string();
        Box::pin(async move { self.load(&id) })
    }
}

/// In-process definition store.
#[derive(Default)]
pub struct MemoryDefinitionStore {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.id.clone(), definition);
    }

    pub fn remove(&self, id: &str) -> Option<WorkflowDefinition> {
        self.definitions.write().unwrap_or_else(|e| e.into_inner()).remove(id)
    }

    pub fn get(&self, id: &str) -> Option<WorkflowDefinition> {
        self.definitions.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }
}

impl DefinitionStore for MemoryDefinitionStore {
    fn load_workflow_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let found = self.get(id);
        Box::pin(async move { Ok(found) })
    }
}
