//! Module repository — named in-memory source archives, materialized to a
//! per-session scratch directory so the script engine can import them.
//!
//! The host process's own code is never extended at runtime; loaded modules
//! only become visible to interpreter subprocesses through the search-path
//! environment variable. Module names are unique and duplicates are rejected.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ModuleError;

/// A module's source files, keyed by relative path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceArchive {
    files: BTreeMap<String, String>,
}

impl SourceArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Parse the JSON map form used on the wire.
    pub fn from_json(raw: &[u8]) -> Result<Self, ModuleError> {
        serde_json::from_slice(raw).map_err(|e| ModuleError::Archive(e.to_string()))
    }
}

#[derive(Debug)]
struct LoadedModule {
    root: PathBuf,
    files: Vec<String>,
}

/// Registry of loaded modules and their on-disk materializations.
pub struct ModuleRepository {
    base: PathBuf,
    modules: RwLock<HashMap<String, LoadedModule>>,
}

impl ModuleRepository {
    /// Scratch space lives under the system temp dir, namespaced by session.
    pub fn new(session_id: &str) -> Self {
        Self::with_base(std::env::temp_dir().join(format!("outpost-{session_id}")))
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self {
            base,
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Materialize an archive under the module's directory and register it.
    /// Duplicate names are rejected; the existing module is untouched.
    pub async fn load(&self, name: &str, archive: SourceArchive) -> Result<usize, ModuleError> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ModuleError::Archive(format!("invalid module name {name:?}")));
        }

        let mut modules = self.modules.write().await;
        if modules.contains_key(name) {
            return Err(ModuleError::Duplicate {
                name: name.to_string(),
            });
        }

        let root = self.base.join(name);
        let mut written = Vec::new();
        for (relpath, source) in &archive.files {
            let target = resolve_member(&root, relpath)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, source).await?;
            written.push(relpath.clone());
        }

        let count = written.len();
        modules.insert(
            name.to_string(),
            LoadedModule {
                root,
                files: written,
            },
        );
        tracing::debug!(module = %name, files = count, "Loaded module");
        Ok(count)
    }

    /// Remove a module and delete its materialized tree.
    pub async fn remove(&self, name: &str) -> Result<(), ModuleError> {
        let module = self
            .modules
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ModuleError::Unknown {
                name: name.to_string(),
            })?;
        if tokio::fs::metadata(&module.root).await.is_ok() {
            tokio::fs::remove_dir_all(&module.root).await?;
        }
        tracing::debug!(module = %name, "Removed module");
        Ok(())
    }

    /// File listing for one module.
    pub async fn list(&self, name: &str) -> Result<Vec<String>, ModuleError> {
        let modules = self.modules.read().await;
        modules
            .get(name)
            .map(|m| m.files.clone())
            .ok_or_else(|| ModuleError::Unknown {
                name: name.to_string(),
            })
    }

    /// All modules with their file listings, sorted by name.
    pub async fn list_all(&self) -> Vec<(String, Vec<String>)> {
        let modules = self.modules.read().await;
        let mut entries: Vec<_> = modules
            .iter()
            .map(|(name, m)| (name.clone(), m.files.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Module roots to export to interpreter subprocesses.
    pub async fn search_paths(&self) -> Vec<PathBuf> {
        let modules = self.modules.read().await;
        let mut paths: Vec<_> = modules.values().map(|m| m.root.clone()).collect();
        paths.sort();
        paths
    }

    /// Delete the whole scratch tree on shutdown.
    pub async fn clear(&self) {
        self.modules.write().await.clear();
        if tokio::fs::metadata(&self.base).await.is_ok() {
            let _ = tokio::fs::remove_dir_all(&self.base).await;
        }
    }
}

/// Resolve an archive member path under the module root, rejecting absolute
/// paths and parent-directory traversal.
fn resolve_member(root: &Path, relpath: &str) -> Result<PathBuf, ModuleError> {
    let rel = Path::new(relpath);
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(ModuleError::Archive(format!(
            "unsafe member path {relpath:?}"
        )));
    }
    Ok(root.join(rel))
}
