//! Module discovery and dependency ordering.
//!
//! Modules are registered in code (built-ins) or instantiated from `*.toml`
//! manifests in the extension directory through a build-time factory table.
//! Resolution drops duplicates and disabled ids, then orders the rest
//! depth-first by dependency, excluding anything with a missing dependency or
//! a dependency cycle.

use crate::error::ExtensionError;
use crate::extensions::builtin;
use crate::extensions::traits::Extension;

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// A module manifest from the extension directory.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Manifest {
    /// Registered factory kind.
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Kind-specific settings.
    #[serde(default)]
    pub settings: toml::Table,
}

impl Manifest {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Deserialize the settings table into a kind's settings type.
    pub fn settings<T: serde::de::DeserializeOwned>(&self) -> Result<T, ExtensionError> {
        toml::Value::Table(self.settings.clone())
            .try_into()
            .map_err(|error: toml::de::Error| ExtensionError::InvalidSettings {
                id: self.id.clone(),
                message: error.to_string(),
            })
    }
}

/// Builds a module from its manifest.
pub type ExtensionFactory = fn(&Manifest) -> Result<Arc<dyn Extension>, ExtensionError>;

/// Why a module is not in the active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    Disabled,
    MissingDependency(String),
    DependencyExcluded(String),
    Cycle,
}

impl std::fmt::Display for Exclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exclusion::Disabled => write!(f, "disabled by configuration"),
            Exclusion::MissingDependency(id) => write!(f, "missing dependency '{id}'"),
            Exclusion::DependencyExcluded(id) => write!(f, "dependency '{id}' is excluded"),
            Exclusion::Cycle => write!(f, "dependency cycle"),
        }
    }
}

/// Active modules in dependency order, plus what was left out and why.
pub struct Resolved {
    pub active: Vec<Arc<dyn Extension>>,
    pub excluded: Vec<(String, Exclusion)>,
}

/// Collects candidate modules before resolution.
pub struct ExtensionRegistry {
    factories: BTreeMap<&'static str, ExtensionFactory>,
    candidates: Vec<Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    /// Empty registry with no factory kinds.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            candidates: Vec::new(),
        }
    }

    /// Registry with the built-in factory kinds and built-in modules registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (kind, factory) in builtin::FACTORIES {
            registry.register_kind(*kind, *factory);
        }
        for module in builtin::default_modules() {
            registry.register(module);
        }
        registry
    }

    pub fn register_kind(&mut self, kind: &'static str, factory: ExtensionFactory) {
        self.factories.insert(kind, factory);
    }

    /// Add a candidate. Later registrants with an id already taken are dropped.
    pub fn register(&mut self, module: Arc<dyn Extension>) -> bool {
        let id = &module.descriptor().id;
        if self.candidates.iter().any(|c| &c.descriptor().id == id) {
            tracing::warn!(extension = %id, "dropping duplicate extension id");
            return false;
        }
        tracing::debug!(extension = %id, "extension registered");
        self.candidates.push(module);
        true
    }

    /// Instantiate a module from a manifest via the factory table.
    pub fn instantiate(&self, manifest: &Manifest, path: &Path) -> Result<Arc<dyn Extension>, ExtensionError> {
        let factory = self
            .factories
            .get(manifest.kind.as_str())
            .ok_or_else(|| ExtensionError::UnknownKind {
                kind: manifest.kind.clone(),
                path: path.display().to_string(),
            })?;
        factory(manifest)
    }

    /// Scan a directory of `*.toml` manifests once, registering every module
    /// that instantiates. Failures are logged and skipped.
    pub async fn discover(&mut self, dir: &Path) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %dir.display(), "extension directory not found");
                return Ok(0);
            }
            Err(error) => return Err(error),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut registered = 0;
        for path in paths {
            match self.load_manifest(&path).await {
                Ok(module) => {
                    if self.register(module) {
                        registered += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "skipping extension manifest");
                }
            }
        }

        tracing::info!(path = %dir.display(), registered, "extension manifests discovered");
        Ok(registered)
    }

    async fn load_manifest(&self, path: &Path) -> Result<Arc<dyn Extension>, ExtensionError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| ExtensionError::InvalidManifest {
                path: path.display().to_string(),
                message: error.to_string(),
            })?;
        let manifest: Manifest =
            toml::from_str(&raw).map_err(|error| ExtensionError::InvalidManifest {
                path: path.display().to_string(),
                message: error.to_string(),
            })?;
        self.instantiate(&manifest, path)
    }

    /// Drop disabled modules and order the rest by dependency.
    pub fn resolve(self, disabled: &[String]) -> Resolved {
        let mut excluded = Vec::new();
        let mut enabled = Vec::new();
        for module in self.candidates {
            let id = module.descriptor().id.clone();
            if disabled.contains(&id) {
                excluded.push((id, Exclusion::Disabled));
            } else {
                enabled.push(module);
            }
        }

        let graph: Vec<(String, Vec<String>)> = enabled
            .iter()
            .map(|m| {
                let descriptor = m.descriptor();
                (descriptor.id.clone(), descriptor.dependencies.clone())
            })
            .collect();
        let (order, ordering_excluded) = dependency_order(&graph);

        for (id, reason) in &ordering_excluded {
            tracing::warn!(extension = %id, %reason, "excluding extension");
        }
        excluded.extend(ordering_excluded);

        let mut by_id: HashMap<String, Arc<dyn Extension>> = enabled
            .into_iter()
            .map(|m| (m.descriptor().id.clone(), m))
            .collect();
        let active: Vec<Arc<dyn Extension>> =
            order.iter().filter_map(|id| by_id.remove(id)).collect();

        tracing::info!(
            active = ?order,
            excluded = excluded.len(),
            "extension order resolved"
        );

        Resolved { active, excluded }
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done(bool),
}

/// Depth-first topological order of `(id, dependencies)` pairs, in input order
/// where dependencies allow. Returns the active order and the excluded ids.
pub fn dependency_order(graph: &[(String, Vec<String>)]) -> (Vec<String>, Vec<(String, Exclusion)>) {
    let dependencies: HashMap<&str, &[String]> = graph
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.as_slice()))
        .collect();

    let mut visits: HashMap<&str, Visit> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut order = Vec::new();
    let mut reasons: HashMap<&str, Exclusion> = HashMap::new();

    fn visit<'a>(
        id: &'a str,
        dependencies: &HashMap<&'a str, &'a [String]>,
        visits: &mut HashMap<&'a str, Visit>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
        reasons: &mut HashMap<&'a str, Exclusion>,
    ) -> bool {
        match visits.get(id) {
            Some(Visit::Done(active)) => return *active,
            Some(Visit::InProgress) => {
                // every module from the first occurrence of `id` on the stack is in the cycle
                if let Some(start) = stack.iter().position(|s| *s == id) {
                    for member in &stack[start..] {
                        reasons.insert(*member, Exclusion::Cycle);
                    }
                }
                return false;
            }
            None => {}
        }

        visits.insert(id, Visit::InProgress);
        stack.push(id);

        let mut active = true;
        for dependency in dependencies.get(id).copied().unwrap_or_default() {
            let Some((&dependency, _)) = dependencies.get_key_value(dependency.as_str()) else {
                reasons
                    .entry(id)
                    .or_insert_with(|| Exclusion::MissingDependency(dependency.clone()));
                active = false;
                continue;
            };
            if !visit(dependency, dependencies, visits, stack, order, reasons) {
                reasons
                    .entry(id)
                    .or_insert_with(|| Exclusion::DependencyExcluded(dependency.to_string()));
                active = false;
            }
        }

        stack.pop();
        visits.insert(id, Visit::Done(active));
        if active {
            order.push(id.to_string());
        }
        active
    }

    for (id, _) in graph {
        visit(
            id,
            &dependencies,
            &mut visits,
            &mut stack,
            &mut order,
            &mut reasons,
        );
    }

    let active: HashSet<&str> = order.iter().map(String::as_str).collect();
    let excluded = graph
        .iter()
        .filter(|(id, _)| !active.contains(id.as_str()))
        .map(|(id, _)| {
            let reason = reasons.remove(id.as_str()).unwrap_or(Exclusion::Cycle);
            (id.clone(), reason)
        })
        .collect();

    (order, excluded)
}
