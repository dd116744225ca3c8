//! Entity storage: phase/state directories and file movement.
//!
//! The filesystem is the authoritative state. An entity is a regular file
//! under `<root>/<phase>/<state>/`; moving it between states is a rename,
//! so an entity is never observable in two directories at once.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::config::{FAILED_STATE, WorkflowConfig};

pub struct EntityStore {
    dirs: BTreeMap<(String, String), PathBuf>,
}

impl EntityStore {
    pub fn new(root: &Path, config: &WorkflowConfig) -> Self {
        let mut dirs = BTreeMap::new();
        for phase in &config.phases {
            for state in &phase.states {
                dirs.insert(
                    (phase.name.clone(), state.clone()),
                    root.join(&phase.name).join(state),
                );
            }
            dirs.insert(
                (phase.name.clone(), FAILED_STATE.to_string()),
                root.join(&phase.name).join(FAILED_STATE),
            );
        }
        Self { dirs }
    }

    /// Create every declared state directory plus the per-phase `_failed`
    /// quarantine. Idempotent; existing directories are left alone.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in self.dirs.values() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn dir_for(&self, phase: &str, state: &str) -> Result<&Path> {
        self.dirs
            .get(&(phase.to_string(), state.to_string()))
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("no directory mapped for {phase}/{state}"))
    }

    pub fn entity_path(&self, phase: &str, state: &str, name: &str) -> Result<PathBuf> {
        Ok(self.dir_for(phase, state)?.join(name))
    }

    /// List entity filenames in `<phase>/<state>`, sorted ascending.
    ///
    /// Hidden files (leading `.`) and non-file entries are skipped.
    pub fn list_entities(&self, phase: &str, state: &str) -> Result<Vec<String>> {
        let dir = self.dir_for(phase, state)?;
        let mut names = Vec::new();
        let entries =
            fs::read_dir(dir).with_context(|| format!("list directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read directory {}", dir.display()))?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %entry.path().display(), "skipping non-utf8 entity name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Rename an entity from one state directory to another.
    ///
    /// An existing destination means entity names are not unique across the
    /// phase's states; that breaks the store's identity assumption, so it is
    /// fatal rather than overwritten.
    pub fn move_entity(&self, phase: &str, from: &str, to: &str, name: &str) -> Result<()> {
        let source = self.entity_path(phase, from, name)?;
        let destination = self.entity_path(phase, to, name)?;
        if destination.exists() {
            bail!(
                "cannot move '{name}' to {phase}/{to}: destination already exists at {}",
                destination.display()
            );
        }
        fs::rename(&source, &destination).with_context(|| {
            format!(
                "move entity {} -> {}",
                source.display(),
                destination.display()
            )
        })?;
        Ok(())
    }
}
