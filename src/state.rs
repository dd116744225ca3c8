//! Runtime state: the persisted phase cursor.
//!
//! A single JSON file under the workflow root records which phase the main
//! loop is on, so an interrupted run resumes where it left off.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct RuntimeState {
    current_phase: String,
}

pub struct RuntimeStateStore {
    path: PathBuf,
}

impl RuntimeStateStore {
    pub fn new(root: &Path, file_name: &str) -> Self {
        Self {
            path: root.join(file_name),
        }
    }

    /// Load the persisted phase cursor.
    ///
    /// A missing file is a fresh start. An unreadable or unparsable file is
    /// reported and also treated as a fresh start rather than aborting the
    /// run.
    pub fn load(&self) -> Option<String> {
        if !self.path.exists() {
            return None;
        }
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unable to read state file; treating as fresh start");
                return None;
            }
        };
        match serde_json::from_str::<RuntimeState>(&contents) {
            Ok(state) => {
                debug!(path = %self.path.display(), phase = %state.current_phase, "runtime state loaded");
                Some(state.current_phase)
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "corrupt state file; treating as fresh start");
                None
            }
        }
    }

    /// Atomically persist the phase cursor (temp file + rename).
    pub fn save(&self, current_phase: &str) -> Result<()> {
        debug!(path = %self.path.display(), phase = %current_phase, "writing runtime state");
        let state = RuntimeState {
            current_phase: current_phase.to_string(),
        };
        let mut buf = serde_json::to_string_pretty(&state)?;
        buf.push('\n');

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &buf)
            .with_context(|| format!("write temp state file {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace state file {}", self.path.display()))?;
        Ok(())
    }
}
