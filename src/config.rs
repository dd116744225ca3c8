//! Workflow document model, YAML loading, and validation.
//!
//! The on-disk format is YAML. Deserialization lands in raw serde structs
//! which are then validated field by field into the typed model, so every
//! rejection names the offending phase, transition, or key.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

/// Reserved per-phase quarantine state. Never declarable in `states`.
pub const FAILED_STATE: &str = "_failed";

const DEFAULT_RETRIES: u32 = 3;

/// A shell hook: the command plus an optional stdin template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub cmd: String,
    pub stdin: Option<String>,
}

/// How a phase's transition rules are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseMode {
    /// Rule-major: each rule sweeps its source state, grouped concurrency allowed.
    #[default]
    Transitions,
    /// Entity-major: drive one entity at a time until it rests. Sequential.
    Entity,
}

/// A rule moving entities from one state to another, optionally via a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: String,
    pub to: String,
    pub cmd: Option<String>,
    pub stdin: Option<String>,
    pub jump: Option<String>,
}

impl TransitionRule {
    /// The hook to run for this rule, if any. `None` means a pure move.
    pub fn hook(&self) -> Option<HookSpec> {
        self.cmd.as_ref().map(|cmd| HookSpec {
            cmd: cmd.clone(),
            stdin: self.stdin.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseConfig {
    pub name: String,
    pub states: Vec<String>,
    pub mode: PhaseMode,
    pub transitions: Vec<TransitionRule>,
    pub completions: Vec<HookSpec>,
}

/// Fully validated workflow. Phase order is declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub phases: Vec<PhaseConfig>,
    pub environment: BTreeMap<String, String>,
    pub retries: u32,
    pub init: Option<HookSpec>,
}

impl WorkflowConfig {
    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|phase| phase.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|phase| phase.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    phases: serde_yaml::Mapping,
    #[serde(default)]
    retries: Option<i64>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    environment: Option<BTreeMap<String, String>>,
    #[serde(default)]
    init: Option<RawHook>,
}

#[derive(Debug, Deserialize)]
struct RawPhase {
    states: Vec<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    transitions: Vec<RawTransition>,
    #[serde(default)]
    completions: Option<Vec<RawHook>>,
    #[serde(default)]
    completion: Option<Vec<RawHook>>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    from: String,
    to: String,
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    jump: Option<String>,
}

/// Hook specs are either a bare command string or `{cmd, stdin?}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawHook {
    Command(String),
    Structured {
        cmd: String,
        #[serde(default)]
        stdin: Option<String>,
    },
}

impl RawHook {
    fn into_spec(self, field: &str) -> Result<HookSpec> {
        let (cmd, stdin) = match self {
            RawHook::Command(cmd) => (cmd, None),
            RawHook::Structured { cmd, stdin } => (cmd, stdin),
        };
        if cmd.trim().is_empty() {
            bail!("{field} has an empty 'cmd'");
        }
        Ok(HookSpec { cmd, stdin })
    }
}

/// Resolve the CLI `workflow` argument to a file path.
///
/// An existing path wins; otherwise the argument is a logical name under
/// `<config-home>/dirorch/workflows/<name>.yml`, where `<config-home>` is
/// `$XDG_CONFIG_DIR` if set, else `<home>/.config`.
pub fn resolve_workflow_path(workflow: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(workflow);
    if direct.exists() {
        return Ok(direct);
    }

    let config_home = match env::var_os("XDG_CONFIG_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = env::var_os("HOME").ok_or_else(|| {
                anyhow!("workflow '{workflow}' is not a file and no home directory is available")
            })?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(config_home
        .join("dirorch")
        .join("workflows")
        .join(format!("{workflow}.yml")))
}

/// Load and validate a workflow document from `path`.
pub fn load_workflow(path: &Path) -> Result<WorkflowConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read workflow file {}", path.display()))?;
    parse_workflow(&contents).with_context(|| format!("invalid workflow {}", path.display()))
}

/// Parse and validate a workflow document.
pub fn parse_workflow(contents: &str) -> Result<WorkflowConfig> {
    let raw: RawWorkflow = serde_yaml::from_str(contents).context("parse workflow yaml")?;

    if raw.phases.is_empty() {
        bail!("workflow must include a non-empty 'phases' mapping");
    }

    let environment = merge_environment(raw.env, raw.environment);
    let retries = parse_retries(raw.retries)?;
    let init = raw
        .init
        .map(|hook| hook.into_spec("'init'"))
        .transpose()?;

    let mut phases = Vec::with_capacity(raw.phases.len());
    for (key, value) in raw.phases {
        let name = key
            .as_str()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("phase names must be non-empty strings"))?
            .to_string();
        let raw_phase: RawPhase = serde_yaml::from_value(value)
            .with_context(|| format!("phase '{name}' is not a valid phase mapping"))?;
        phases.push(parse_phase(name, raw_phase)?);
    }

    validate_cross_references(&phases)?;

    Ok(WorkflowConfig {
        phases,
        environment,
        retries,
        init,
    })
}

/// `env` entries override `environment` entries when both mappings are given.
fn merge_environment(
    env: Option<BTreeMap<String, String>>,
    environment: Option<BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = environment.unwrap_or_default();
    merged.extend(env.unwrap_or_default());
    merged
}

fn parse_retries(raw: Option<i64>) -> Result<u32> {
    let Some(retries) = raw else {
        return Ok(DEFAULT_RETRIES);
    };
    u32::try_from(retries).map_err(|_| anyhow!("'retries' must be a non-negative integer"))
}

fn parse_phase(name: String, raw: RawPhase) -> Result<PhaseConfig> {
    let states = parse_states(&name, raw.states)?;
    let mode = parse_mode(&name, raw.mode)?;
    let transitions = parse_transitions(&name, &states, raw.transitions)?;

    // 'completions' wins over the singular alias when both are present.
    let raw_completions = raw.completions.or(raw.completion).unwrap_or_default();
    let mut completions = Vec::with_capacity(raw_completions.len());
    for (index, hook) in raw_completions.into_iter().enumerate() {
        let field = format!("phase '{name}' completion hook [{}]", index + 1);
        completions.push(hook.into_spec(&field)?);
    }

    Ok(PhaseConfig {
        name,
        states,
        mode,
        transitions,
        completions,
    })
}

fn parse_states(phase: &str, states: Vec<String>) -> Result<Vec<String>> {
    if states.is_empty() {
        bail!("phase '{phase}' must include a non-empty 'states' list");
    }
    let mut seen: Vec<&str> = Vec::with_capacity(states.len());
    for state in &states {
        if state.is_empty() {
            bail!("phase '{phase}' contains an empty state name");
        }
        if state == FAILED_STATE {
            bail!("phase '{phase}' cannot declare reserved state '{FAILED_STATE}' in 'states'");
        }
        if seen.contains(&state.as_str()) {
            bail!("phase '{phase}' has duplicate state '{state}'");
        }
        seen.push(state);
    }
    Ok(states)
}

fn parse_mode(phase: &str, raw: Option<String>) -> Result<PhaseMode> {
    let Some(raw) = raw else {
        return Ok(PhaseMode::Transitions);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "transitions" => Ok(PhaseMode::Transitions),
        "entity" => Ok(PhaseMode::Entity),
        other => bail!(
            "phase '{phase}' has invalid mode '{other}' (supported: 'transitions', 'entity')"
        ),
    }
}

fn parse_transitions(
    phase: &str,
    states: &[String],
    raw: Vec<RawTransition>,
) -> Result<Vec<TransitionRule>> {
    let mut transitions = Vec::with_capacity(raw.len());
    for item in raw {
        let label = format!("phase '{phase}' transition '{}->{}'", item.from, item.to);
        if item.from.is_empty() {
            bail!("phase '{phase}' transition is missing a valid 'from'");
        }
        if item.to.is_empty() {
            bail!("phase '{phase}' transition is missing a valid 'to'");
        }
        if !states.contains(&item.from) {
            bail!("{label}: source '{}' is not a declared state", item.from);
        }
        if !states.contains(&item.to) {
            bail!("{label}: destination '{}' is not a declared state", item.to);
        }
        if let Some(cmd) = &item.cmd
            && cmd.trim().is_empty()
        {
            bail!("{label} has an empty 'cmd'");
        }
        if item.stdin.is_some() && item.cmd.is_none() {
            bail!("{label} requires 'cmd' when 'stdin' is set");
        }
        if let Some(jump) = &item.jump
            && jump.is_empty()
        {
            bail!("{label} has an empty 'jump'");
        }
        transitions.push(TransitionRule {
            from: item.from,
            to: item.to,
            cmd: item.cmd,
            stdin: item.stdin,
            jump: item.jump,
        });
    }
    Ok(transitions)
}

/// Jump targets may point at any phase, so they are checked after all phases parse.
fn validate_cross_references(phases: &[PhaseConfig]) -> Result<()> {
    for phase in phases {
        for transition in &phase.transitions {
            if let Some(jump) = &transition.jump
                && phases.iter().all(|candidate| &candidate.name != jump)
            {
                bail!(
                    "phase '{}' transition '{}->{}' jump target '{jump}' is undefined",
                    phase.name,
                    transition.from,
                    transition.to,
                );
            }
        }
    }
    Ok(())
}
