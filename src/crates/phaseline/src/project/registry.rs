//! Project registry
//!
//! Maps project IDs to their root directories. The registry file is YAML:
//!
//! ```yaml
//! projects:
//!   - id: api
//!     name: API server
//!     path: /srv/projects/api
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::workflow::loader::expand_env;
use crate::{OrchestratorError, Result};

/// A registered project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

#[derive(Debug, Default)]
pub struct ProjectRegistry {
    projects: RwLock<BTreeMap<String, ProjectEntry>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a registry document; `${VAR}` references are expanded first
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(&expand_env(content)).map_err(|e| {
            OrchestratorError::General(format!("Failed to parse project registry: {}", e))
        })?;
        let registry = Self::new();
        for entry in file.projects {
            registry.insert(entry)?;
        }
        Ok(registry)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::General(format!("Failed to read project registry {:?}: {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn register(&self, id: impl Into<String>, path: impl Into<PathBuf>) -> Result<()> {
        let id = id.into();
        self.insert(ProjectEntry {
            name: id.clone(),
            id,
            path: path.into(),
        })
    }

    fn insert(&self, mut entry: ProjectEntry) -> Result<()> {
        if entry.id.trim().is_empty() {
            return Err(OrchestratorError::Validation("project id is required".into()));
        }
        if entry.name.is_empty() {
            entry.name = entry.id.clone();
        }
        self.projects.write().insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<ProjectEntry> {
        self.projects.read().get(id).cloned()
    }

    pub fn path(&self, id: &str) -> Option<PathBuf> {
        self.projects.read().get(id).map(|p| p.path.clone())
    }

    /// All projects sorted by ID
    pub fn list(&self) -> Vec<ProjectEntry> {
        self.projects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.projects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml() {
        let registry = ProjectRegistry::from_yaml(
            r#"
projects:
  - id: api
    name: API server
    path: /srv/api
  - id: web
    path: /srv/web
"#,
        )
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.path("api"), Some(PathBuf::from("/srv/api")));
        assert_eq!(registry.get("web").unwrap().name, "web");
        assert!(registry.path("nope").is_none());
    }

    #[test]
    fn test_rejects_empty_id() {
        let err = ProjectRegistry::from_yaml("projects:\n  - id: ''\n    path: /x\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("projects.yaml");
        std::fs::write(&file, "projects:\n  - id: a\n    path: /tmp/a\n").unwrap();
        let registry = ProjectRegistry::from_file(&file).unwrap();
        assert_eq!(registry.list()[0].id, "a");
        assert!(ProjectRegistry::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
