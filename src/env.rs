//! Hook environment composition.
//!
//! Every hook sees the inherited process environment, the workflow's own
//! `env` entries, and a `DIR_<PHASE>_<STATE>` variable per declared
//! phase/state pair. Workflow `env` values are themselves templates and may
//! reference the `DIR_*` variables or each other; resolution iterates until
//! no entry makes progress.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Result, bail};

use crate::config::WorkflowConfig;
use crate::template::TemplateRenderer;

/// Per-hook extra variable holding the absolute source path of the entity.
pub const INPUT_ENTITY_VAR: &str = "INPUT_ENTITY";

/// The composed hook environment, built once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEnv {
    /// Full child-process environment: process env with defined vars folded in.
    full: BTreeMap<String, String>,
    /// Orchestrator-defined variables only. This is the template context;
    /// inherited process env is never exposed to templates.
    defined: BTreeMap<String, String>,
}

impl HookEnv {
    /// Compose the environment for all hooks of this run.
    ///
    /// `process_env` is injected by the caller (normally `std::env::vars()`)
    /// so composition stays deterministic under test.
    pub fn compose(
        config: &WorkflowConfig,
        root: &Path,
        renderer: &TemplateRenderer,
        process_env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let dir_vars = dir_vars(config, root);
        let workflow_env = render_workflow_env(&config.environment, &dir_vars, renderer)?;

        let mut defined = workflow_env;
        defined.extend(dir_vars);

        let mut full: BTreeMap<String, String> = process_env.into_iter().collect();
        full.extend(defined.clone());

        Ok(Self { full, defined })
    }

    /// Environment for a child process, with hook-specific `extra` vars on top.
    pub fn child_env(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = self.full.clone();
        env.extend(extra.clone());
        env
    }

    /// Template context: defined variables plus hook-specific `extra` vars.
    pub fn template_vars(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut vars = self.defined.clone();
        vars.extend(extra.clone());
        vars
    }
}

/// `DIR_<PHASE>_<STATE>` entries for every declared pair. The `_failed`
/// directories are deliberately not exposed.
fn dir_vars(config: &WorkflowConfig, root: &Path) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for phase in &config.phases {
        for state in &phase.states {
            let key = format!("DIR_{}_{}", mangle_token(&phase.name), mangle_token(state));
            let path = root.join(&phase.name).join(state);
            vars.insert(key, path.display().to_string());
        }
    }
    vars
}

/// Uppercase, then replace every character outside `[A-Z0-9]` with `_`.
pub fn mangle_token(raw: &str) -> String {
    raw.chars()
        .flat_map(char::to_uppercase)
        .map(|c| {
            if c.is_ascii_uppercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Render workflow `env` values, resolving references between entries.
///
/// Each value renders against the `DIR_*` map plus entries already rendered.
/// A round that makes no progress means the remaining entries are
/// unresolvable; the first of them is reported.
fn render_workflow_env(
    raw: &BTreeMap<String, String>,
    dir_vars: &BTreeMap<String, String>,
    renderer: &TemplateRenderer,
) -> Result<BTreeMap<String, String>> {
    let mut remaining = raw.clone();
    let mut rendered: BTreeMap<String, String> = BTreeMap::new();

    while !remaining.is_empty() {
        let mut progressed = false;
        let mut errors: BTreeMap<String, String> = BTreeMap::new();

        for (key, template) in remaining.clone() {
            let mut context = dir_vars.clone();
            context.extend(rendered.clone());
            match renderer.render(&template, &context) {
                Ok(value) => {
                    rendered.insert(key.clone(), value);
                    remaining.remove(&key);
                    progressed = true;
                }
                Err(err) => {
                    errors.insert(key, format!("{err:#}"));
                }
            }
        }

        if !progressed {
            if let Some((key, reason)) = errors.iter().next() {
                bail!("environment variable '{key}' template failed: {reason}");
            }
            bail!("workflow environment rendering made no progress");
        }
    }

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_workflow;

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn mangling_is_deterministic() {
        assert_eq!(mangle_token("task-items"), "TASK_ITEMS");
        assert_eq!(mangle_token("in.progress"), "IN_PROGRESS");
        assert_eq!(mangle_token("done2"), "DONE2");
    }

    #[test]
    fn dir_vars_cover_every_declared_state_but_not_failed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config =
            parse_workflow("phases:\n  task-items: {states: [new, in.progress]}\n").expect("parse");
        let renderer = TemplateRenderer::new(temp.path());
        let env = HookEnv::compose(&config, temp.path(), &renderer, []).expect("compose");

        let vars = env.template_vars(&BTreeMap::new());
        assert_eq!(
            vars["DIR_TASK_ITEMS_NEW"],
            temp.path().join("task-items").join("new").display().to_string()
        );
        assert!(vars.contains_key("DIR_TASK_ITEMS_IN_PROGRESS"));
        assert!(!vars.keys().any(|key| key.contains("FAILED")));
    }

    #[test]
    fn workflow_env_overrides_process_env_in_child_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = parse_workflow("phases:\n  p: {states: [s]}\nenv:\n  MARKER: ours\n")
            .expect("parse");
        let renderer = TemplateRenderer::new(temp.path());
        let process_env = entries(&[("MARKER", "inherited"), ("PATH", "/bin")]);
        let env = HookEnv::compose(&config, temp.path(), &renderer, process_env).expect("compose");

        let child = env.child_env(&BTreeMap::new());
        assert_eq!(child["MARKER"], "ours");
        assert_eq!(child["PATH"], "/bin");

        // Templates never see the inherited process env.
        let vars = env.template_vars(&BTreeMap::new());
        assert_eq!(vars["MARKER"], "ours");
        assert!(!vars.contains_key("PATH"));
    }

    #[test]
    fn env_values_render_against_dir_vars_and_each_other() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = parse_workflow(
            "phases:\n  p: {states: [inbox]}\nenv:\n  QUEUE: \"{{ DIR_P_INBOX }}\"\n  BACKUP: \"{{ QUEUE }}.bak\"\n",
        )
        .expect("parse");
        let renderer = TemplateRenderer::new(temp.path());
        let env = HookEnv::compose(&config, temp.path(), &renderer, []).expect("compose");

        let vars = env.template_vars(&BTreeMap::new());
        let inbox = temp.path().join("p").join("inbox").display().to_string();
        assert_eq!(vars["QUEUE"], inbox);
        assert_eq!(vars["BACKUP"], format!("{inbox}.bak"));
    }

    #[test]
    fn unresolvable_env_value_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = parse_workflow(
            "phases:\n  p: {states: [s]}\nenv:\n  BROKEN: \"{{ NO_SUCH_VAR }}\"\n",
        )
        .expect("parse");
        let renderer = TemplateRenderer::new(temp.path());
        let err = HookEnv::compose(&config, temp.path(), &renderer, []).unwrap_err();
        assert!(err.to_string().contains("environment variable 'BROKEN'"));
    }

    #[test]
    fn extra_vars_reach_both_child_and_template_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = parse_workflow("phases:\n  p: {states: [s]}\n").expect("parse");
        let renderer = TemplateRenderer::new(temp.path());
        let env = HookEnv::compose(&config, temp.path(), &renderer, []).expect("compose");

        let extra = entries(&[(INPUT_ENTITY_VAR, "/w/p/s/a.txt")]);
        assert_eq!(env.child_env(&extra)[INPUT_ENTITY_VAR], "/w/p/s/a.txt");
        assert_eq!(env.template_vars(&extra)[INPUT_ENTITY_VAR], "/w/p/s/a.txt");
    }
}
