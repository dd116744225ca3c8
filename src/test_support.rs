//! Test-only helpers: scripted hook runners and workspace scaffolding.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;

use crate::config::HookSpec;
use crate::hooks::{HookRunner, HookStatus};

/// One recorded [`HookRunner::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInvocation {
    pub label: String,
    pub cmd: String,
    pub extra_env: BTreeMap<String, String>,
}

/// Hook runner returning scripted statuses without spawning processes.
///
/// Statuses are consumed in invocation order; once the script is drained the
/// default status applies. Every call is recorded.
pub struct ScriptedHookRunner {
    default: HookStatus,
    scripted: Mutex<VecDeque<HookStatus>>,
    invocations: Mutex<Vec<RecordedInvocation>>,
}

impl ScriptedHookRunner {
    pub fn always(status: HookStatus) -> Self {
        Self::with_script(Vec::new(), status)
    }

    pub fn with_script(statuses: Vec<HookStatus>, default: HookStatus) -> Self {
        Self {
            default,
            scripted: Mutex::new(statuses.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().expect("invocations lock").clone()
    }
}

impl HookRunner for ScriptedHookRunner {
    fn run(
        &self,
        hook: &HookSpec,
        extra_env: &BTreeMap<String, String>,
        label: &str,
    ) -> Result<HookStatus> {
        self.invocations
            .lock()
            .expect("invocations lock")
            .push(RecordedInvocation {
                label: label.to_string(),
                cmd: hook.cmd.clone(),
                extra_env: extra_env.clone(),
            });
        let status = self
            .scripted
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(self.default);
        Ok(status)
    }
}

/// Jump handler for tests that expect no jumps to fire.
pub fn no_jumps() -> impl FnMut(&str) -> Result<()> {
    |target: &str| panic!("unexpected jump to '{target}'")
}

/// Create entity files under `<root>/<rel_dir>/`.
pub fn write_entities(root: &Path, rel_dir: &str, names: &[&str]) {
    let dir = root.join(rel_dir);
    fs::create_dir_all(&dir).expect("create entity dir");
    for name in names {
        fs::write(dir.join(name), name).expect("write entity");
    }
}
