//! Registry of supervisors keyed by model name, plus on-disk discovery of
//! model directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;

use crate::descriptor::{find_descriptor, load_descriptor_from_dir, ModelDescriptor};
use crate::error::{Result, SupervisorError};
use crate::supervisor::Supervisor;

/// Snapshot of one model's status, as returned by [`Registry::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub running: bool,
    pub version: String,
    pub handlers: Vec<String>,
}

/// Insertion-ordered collection of supervisors. Owns every supervisor it
/// contains: `unregister` stops and drops it, and dropping the registry
/// stops everything still running.
#[derive(Default)]
pub struct Registry {
    supervisors: RwLock<IndexMap<String, Arc<Supervisor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            supervisors: RwLock::new(IndexMap::new()),
        }
    }

    pub fn register(&self, descriptor: ModelDescriptor) -> Result<Arc<Supervisor>> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        let mut guard = self.supervisors.write().unwrap();
        if guard.contains_key(&name) {
            return Err(SupervisorError::ConfigInvalid {
                name,
                detail: "a model with this name is already registered".to_string(),
            });
        }
        let supervisor = Arc::new(Supervisor::new(descriptor));
        guard.insert(name, Arc::clone(&supervisor));
        Ok(supervisor)
    }

    pub fn register_from_dir(&self, model_dir: &Path) -> Result<Arc<Supervisor>> {
        let descriptor = load_descriptor_from_dir(model_dir)?;
        self.register(descriptor)
    }

    /// Stops the supervisor (if running) and removes it from the registry.
    pub fn unregister(&self, name: &str, stop_timeout: Duration) -> Result<()> {
        let supervisor = {
            let mut guard = self.supervisors.write().unwrap();
            guard.shift_remove(name)
        };
        if let Some(supervisor) = supervisor {
            supervisor.stop(stop_timeout)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.supervisors.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.supervisors.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.supervisors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts every registered model. Never aborts the batch on a single
    /// failure; returns the per-model outcome.
    pub fn start_all(&self, timeout: Duration) -> HashMap<String, Option<SupervisorError>> {
        let snapshot: Vec<(String, Arc<Supervisor>)> = self
            .supervisors
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut outcomes = HashMap::new();
        for (name, supervisor) in snapshot {
            let outcome = supervisor.start(timeout).err();
            if let Some(err) = &outcome {
                tracing::error!(model = %name, error = %err, "model failed to start");
            }
            outcomes.insert(name, outcome);
        }
        outcomes
    }

    pub fn stop_all(&self, timeout: Duration) -> HashMap<String, Option<SupervisorError>> {
        let snapshot: Vec<(String, Arc<Supervisor>)> = self
            .supervisors
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut outcomes = HashMap::new();
        for (name, supervisor) in snapshot {
            let outcome = supervisor.stop(timeout).err();
            if let Some(err) = &outcome {
                tracing::error!(model = %name, error = %err, "model failed to stop cleanly");
            }
            outcomes.insert(name, outcome);
        }
        outcomes
    }

    pub fn status(&self) -> HashMap<String, ModelStatus> {
        self.supervisors
            .read()
            .unwrap()
            .iter()
            .map(|(name, supervisor)| {
                let descriptor = supervisor.descriptor();
                (
                    name.clone(),
                    ModelStatus {
                        running: supervisor.is_running(),
                        version: descriptor.version.clone(),
                        handlers: descriptor
                            .handler_names()
                            .into_iter()
                            .map(str::to_string)
                            .collect(),
                    },
                )
            })
            .collect()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let snapshot: Vec<Arc<Supervisor>> = self
            .supervisors
            .get_mut()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for supervisor in snapshot {
            let _ = supervisor.stop(Duration::from_secs(5));
        }
    }
}

/// Walk `base_dir` looking for model descriptors. Skips dot-prefixed
/// directories; stops descending once a directory's own descriptor is
/// found; duplicate names keep the first discovered and log a warning.
/// The immediate children of `base_dir` are always scanned regardless of
/// `recursive`.
pub fn discover_models(
    base_dir: &Path,
    recursive: bool,
    max_depth: u32,
) -> Result<Vec<(String, PathBuf)>> {
    if !base_dir.is_dir() {
        return Err(SupervisorError::DiscoveryFailed {
            root: base_dir.display().to_string(),
            detail: "not a directory".to_string(),
        });
    }

    let mut found: Vec<(String, PathBuf)> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    fn scan_dir(
        dir: &Path,
        depth: u32,
        recursive: bool,
        max_depth: u32,
        found: &mut Vec<(String, PathBuf)>,
        seen: &mut std::collections::HashSet<String>,
    ) -> Result<()> {
        if let Some(descriptor_path) = find_descriptor(dir) {
            match load_descriptor_from_dir(dir) {
                Ok(descriptor) => {
                    if seen.contains(&descriptor.name) {
                        tracing::warn!(
                            name = %descriptor.name,
                            path = %descriptor_path.display(),
                            "duplicate model name during discovery; keeping first"
                        );
                    } else {
                        seen.insert(descriptor.name.clone());
                        found.push((descriptor.name.clone(), dir.to_path_buf()));
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %descriptor_path.display(), error = %e, "failed to load descriptor during discovery");
                }
            }
            return Ok(());
        }

        if depth > 0 && !recursive {
            return Ok(());
        }
        if depth >= max_depth {
            return Ok(());
        }

        let entries = std::fs::read_dir(dir).map_err(|e| SupervisorError::DiscoveryFailed {
            root: dir.display().to_string(),
            detail: format!("{e}"),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| SupervisorError::DiscoveryFailed {
                root: dir.display().to_string(),
                detail: format!("{e}"),
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let is_dotted = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if is_dotted {
                continue;
            }
            scan_dir(&path, depth + 1, recursive, max_depth, found, seen)?;
        }
        Ok(())
    }

    scan_dir(base_dir, 0, recursive, max_depth, &mut found, &mut seen)?;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_descriptor;

    fn demo_descriptor(name: &str) -> ModelDescriptor {
        let yaml = format!("name: {name}\nclient:\n  module: m\n  class: C\n");
        parse_descriptor(&yaml, "model.yaml").unwrap()
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let registry = Registry::new();
        registry.register(demo_descriptor("demo")).unwrap();
        assert_eq!(registry.names(), vec!["demo".to_string()]);
        registry
            .unregister("demo", Duration::from_millis(10))
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn register_rejects_duplicate_name() {
        let registry = Registry::new();
        registry.register(demo_descriptor("demo")).unwrap();
        let err = registry.register(demo_descriptor("demo"));
        assert!(err.is_err());
    }

    #[test]
    fn status_reports_stopped_models() {
        let registry = Registry::new();
        registry.register(demo_descriptor("demo")).unwrap();
        let status = registry.status();
        assert!(!status["demo"].running);
    }

    #[test]
    fn discovery_skips_dot_directories_and_stops_at_descriptor() {
        let root = tempfile::tempdir().unwrap();
        let model_a = root.path().join("model_a");
        std::fs::create_dir_all(&model_a).unwrap();
        std::fs::write(
            model_a.join("model.yaml"),
            "name: model_a\nclient:\n  module: m\n  class: C\n",
        )
        .unwrap();
        // Nested descriptor beneath model_a must not be discovered: we stop
        // descending once a directory has its own descriptor.
        let nested = model_a.join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("model.yaml"),
            "name: nested_model\nclient:\n  module: m\n  class: C\n",
        )
        .unwrap();

        let dotted = root.path().join(".hidden");
        std::fs::create_dir_all(&dotted).unwrap();
        std::fs::write(
            dotted.join("model.yaml"),
            "name: hidden_model\nclient:\n  module: m\n  class: C\n",
        )
        .unwrap();

        let found = discover_models(root.path(), true, 3).unwrap();
        let names: Vec<String> = found.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["model_a".to_string()]);
    }

    #[test]
    fn discovery_rejects_non_directory_root() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = discover_models(file.path(), true, 3);
        assert!(err.is_err());
    }
}
