//! Shell hook execution with retry semantics.
//!
//! The [`HookRunner`] trait decouples the engine from process spawning.
//! Tests use scripted runners that return predetermined statuses without
//! touching the shell.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::HookSpec;
use crate::env::HookEnv;
use crate::template::TemplateRenderer;

/// Outcome of a hook run across its whole retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Success,
    Exhausted,
}

/// An init or completion hook exhausted its retries. Aborts the run.
#[derive(Debug, Error)]
#[error("{label} failed after retries")]
pub struct HookExhaustedError {
    pub label: String,
}

/// Abstraction over hook execution backends.
pub trait HookRunner: Sync {
    /// Run `hook` with `extra_env` folded into both the child environment
    /// and the stdin template context. `label` identifies the hook in logs.
    fn run(
        &self,
        hook: &HookSpec,
        extra_env: &BTreeMap<String, String>,
        label: &str,
    ) -> Result<HookStatus>;
}

/// Hook runner that spawns the platform shell.
///
/// Child stdout/stderr are inherited so hook output streams straight to the
/// operator's terminal. No timeout is enforced; a stuck hook stalls the run.
pub struct ShellHookRunner {
    root: PathBuf,
    env: HookEnv,
    renderer: TemplateRenderer,
    retries: u32,
}

impl ShellHookRunner {
    pub fn new(root: PathBuf, env: HookEnv, renderer: TemplateRenderer, retries: u32) -> Self {
        Self {
            root,
            env,
            renderer,
            retries,
        }
    }

    fn attempt(
        &self,
        cmd: &str,
        child_env: &BTreeMap<String, String>,
        stdin: Option<&[u8]>,
    ) -> Result<ExitStatus> {
        let mut command = shell_command(cmd);
        command
            .current_dir(&self.root)
            .env_clear()
            .envs(child_env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = command.spawn().context("spawn hook")?;
        if let Some(input) = stdin {
            let mut child_stdin = child.stdin.take().context("hook stdin was not piped")?;
            // A hook that exits without draining stdin is not a failure in
            // itself; the exit status decides.
            if let Err(err) = child_stdin.write_all(input)
                && err.kind() != io::ErrorKind::BrokenPipe
            {
                return Err(err).context("write hook stdin");
            }
        }
        child.wait().context("wait for hook")
    }
}

impl HookRunner for ShellHookRunner {
    fn run(
        &self,
        hook: &HookSpec,
        extra_env: &BTreeMap<String, String>,
        label: &str,
    ) -> Result<HookStatus> {
        let stdin = hook
            .stdin
            .as_ref()
            .map(|template| {
                self.renderer
                    .render(template, &self.env.template_vars(extra_env))
                    .with_context(|| format!("render stdin template for {label}"))
            })
            .transpose()?;
        let child_env = self.env.child_env(extra_env);

        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            match self.attempt(&hook.cmd, &child_env, stdin.as_deref().map(str::as_bytes)) {
                Ok(status) if status.success() => {
                    debug!(hook = %label, attempt, "hook succeeded");
                    return Ok(HookStatus::Success);
                }
                Ok(status) => {
                    warn!(hook = %label, attempt, attempts, exit = ?status.code(), "hook failed");
                }
                Err(err) => {
                    warn!(hook = %label, attempt, attempts, error = %err, "hook failed to run");
                }
            }
        }
        Ok(HookStatus::Exhausted)
    }
}

fn shell_command(cmd: &str) -> Command {
    if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(cmd);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }
}
