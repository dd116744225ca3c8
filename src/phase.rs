//! Phase engine: applies one phase's transition rules to fixpoint.
//!
//! Two application modes exist. `transitions` mode is rule-major: each rule
//! sweeps its source state, and same-prefix entities run concurrently.
//! `entity` mode is entity-major: one entity at a time is driven through the
//! rules until it rests. Both modes finish with the phase's completion hooks.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::{FAILED_STATE, PhaseConfig, PhaseMode, TransitionRule};
use crate::env::INPUT_ENTITY_VAR;
use crate::groups::{group_entities, run_group};
use crate::hooks::{HookExhaustedError, HookRunner, HookStatus};
use crate::store::EntityStore;

/// Callback for transitions carrying a jump. Runs the target phase to
/// fixpoint before returning; invoked on the engine's thread only, after the
/// owning group has fully finished.
pub type JumpHandler<'a> = dyn FnMut(&str) -> Result<()> + 'a;

#[derive(Debug)]
enum EntityOutcome {
    /// Hook succeeded (or the rule is a pure move); entity is in `to`.
    Advanced { jump: Option<String> },
    /// Hook exhausted its retries; entity is quarantined in `_failed`.
    Quarantined,
    /// The file disappeared between the snapshot and processing.
    Vanished,
}

pub struct PhaseRunner<'a, H: HookRunner> {
    store: &'a EntityStore,
    hooks: &'a H,
}

impl<'a, H: HookRunner> PhaseRunner<'a, H> {
    pub fn new(store: &'a EntityStore, hooks: &'a H) -> Self {
        Self { store, hooks }
    }

    /// Run `phase` to fixpoint, then its completion hooks.
    ///
    /// Returns the number of moves taken; quarantine moves count. A zero
    /// return means the phase was already at fixpoint on entry.
    pub fn run_phase(&self, phase: &PhaseConfig, on_jump: &mut JumpHandler<'_>) -> Result<u64> {
        let moved = match phase.mode {
            PhaseMode::Transitions => self.run_transitions_mode(phase, on_jump)?,
            PhaseMode::Entity => self.run_entity_mode(phase, on_jump)?,
        };
        self.run_completions(phase)?;
        info!(phase = %phase.name, moves = moved, "phase reached fixpoint");
        Ok(moved)
    }

    fn run_transitions_mode(&self, phase: &PhaseConfig, on_jump: &mut JumpHandler<'_>) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let mut pass_moves = 0u64;
            for rule in &phase.transitions {
                // Snapshot the source state; files added while the rule runs
                // are picked up on the next pass.
                let names = self.store.list_entities(&phase.name, &rule.from)?;
                for group in group_entities(&names) {
                    if group.concurrent() {
                        info!(
                            phase = %phase.name,
                            from = %rule.from,
                            to = %rule.to,
                            group = group.key.as_deref().unwrap_or(""),
                            entities = group.names.len(),
                            "running grouped transition concurrently"
                        );
                    }
                    let outcomes =
                        run_group(&group, |name| self.process_entity(phase, rule, name))?;
                    // Jumps fire only after the whole group has finished, in
                    // entity start order.
                    for outcome in outcomes {
                        match outcome {
                            EntityOutcome::Advanced { jump } => {
                                pass_moves += 1;
                                if let Some(target) = jump {
                                    on_jump(&target)?;
                                }
                            }
                            EntityOutcome::Quarantined => pass_moves += 1,
                            EntityOutcome::Vanished => {}
                        }
                    }
                }
            }
            total += pass_moves;
            if pass_moves == 0 {
                return Ok(total);
            }
        }
    }

    fn run_entity_mode(&self, phase: &PhaseConfig, on_jump: &mut JumpHandler<'_>) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let mut pass_moves = 0u64;
            // Entities that no rule applies to are at rest until the next pass.
            let mut resting: BTreeSet<String> = BTreeSet::new();
            while let Some((state, name)) = self.next_entity(phase, &resting)? {
                pass_moves += self.drive_entity(phase, &name, &state, &mut resting, on_jump)?;
            }
            total += pass_moves;
            if pass_moves == 0 {
                return Ok(total);
            }
        }
    }

    /// First non-resting entity, scanning declared states in order and
    /// filenames ascending within a state.
    fn next_entity(
        &self,
        phase: &PhaseConfig,
        resting: &BTreeSet<String>,
    ) -> Result<Option<(String, String)>> {
        for state in &phase.states {
            for name in self.store.list_entities(&phase.name, state)? {
                if !resting.contains(&name) {
                    return Ok(Some((state.clone(), name)));
                }
            }
        }
        Ok(None)
    }

    /// Drive one entity through the rules until it rests or is quarantined.
    fn drive_entity(
        &self,
        phase: &PhaseConfig,
        name: &str,
        start_state: &str,
        resting: &mut BTreeSet<String>,
        on_jump: &mut JumpHandler<'_>,
    ) -> Result<u64> {
        let mut state = start_state.to_string();
        let mut moves = 0u64;
        loop {
            let Some(rule) = phase.transitions.iter().find(|rule| rule.from == state) else {
                resting.insert(name.to_string());
                return Ok(moves);
            };
            match self.process_entity(phase, rule, name)? {
                EntityOutcome::Vanished => return Ok(moves),
                EntityOutcome::Quarantined => return Ok(moves + 1),
                EntityOutcome::Advanced { jump } => {
                    moves += 1;
                    state = rule.to.clone();
                    if let Some(target) = jump {
                        on_jump(&target)?;
                    }
                }
            }
        }
    }

    fn process_entity(
        &self,
        phase: &PhaseConfig,
        rule: &TransitionRule,
        name: &str,
    ) -> Result<EntityOutcome> {
        let source = self.store.entity_path(&phase.name, &rule.from, name)?;
        if !source.exists() {
            return Ok(EntityOutcome::Vanished);
        }

        let success = match rule.hook() {
            None => true,
            Some(hook) => {
                let label = format!(
                    "transition hook {}:{}->{} entity={}",
                    phase.name, rule.from, rule.to, name
                );
                let mut extra = BTreeMap::new();
                extra.insert(INPUT_ENTITY_VAR.to_string(), source.display().to_string());
                self.hooks.run(&hook, &extra, &label)? == HookStatus::Success
            }
        };

        if success {
            self.store.move_entity(&phase.name, &rule.from, &rule.to, name)?;
            info!(entity = %name, phase = %phase.name, state = %rule.to, "moved entity");
            Ok(EntityOutcome::Advanced {
                jump: rule.jump.clone(),
            })
        } else {
            self.store
                .move_entity(&phase.name, &rule.from, FAILED_STATE, name)?;
            warn!(
                entity = %name,
                phase = %phase.name,
                from = %rule.from,
                "transition hook exhausted retries; entity quarantined"
            );
            Ok(EntityOutcome::Quarantined)
        }
    }

    fn run_completions(&self, phase: &PhaseConfig) -> Result<()> {
        for (index, hook) in phase.completions.iter().enumerate() {
            let label = format!("completion hook {}[{}]", phase.name, index + 1);
            info!(hook = %label, "running completion hook");
            if self.hooks.run(hook, &BTreeMap::new(), &label)? == HookStatus::Exhausted {
                return Err(HookExhaustedError { label }.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_workflow;
    use crate::test_support::{ScriptedHookRunner, no_jumps, write_entities};
    use std::fs;

    fn setup(
        temp: &tempfile::TempDir,
        yaml: &str,
    ) -> (crate::config::WorkflowConfig, EntityStore) {
        let config = parse_workflow(yaml).expect("parse");
        let store = EntityStore::new(temp.path(), &config);
        store.ensure_layout().expect("layout");
        (config, store)
    }

    #[test]
    fn pure_move_rule_runs_no_hooks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, done]\n    transitions:\n      - {from: new, to: done}\n",
        );
        write_entities(temp.path(), "p/new", &["a.txt", "b.txt"]);

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        let moved = runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .expect("run");

        assert_eq!(moved, 2);
        assert!(hooks.invocations().is_empty());
        assert_eq!(store.list_entities("p", "done").expect("list"), vec!["a.txt", "b.txt"]);
        assert!(store.list_entities("p", "new").expect("list").is_empty());
    }

    #[test]
    fn exhausted_hook_quarantines_without_jumping() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, done]\n    transitions:\n      - {from: new, to: done, cmd: ./hook.sh, jump: p}\n",
        );
        write_entities(temp.path(), "p/new", &["x"]);

        let hooks = ScriptedHookRunner::always(HookStatus::Exhausted);
        let runner = PhaseRunner::new(&store, &hooks);
        let mut jumps = Vec::new();
        let moved = runner
            .run_phase(&config.phases[0], &mut |target: &str| {
                jumps.push(target.to_string());
                Ok(())
            })
            .expect("run");

        // The quarantine move still counts as progress.
        assert_eq!(moved, 1);
        assert!(jumps.is_empty());
        assert_eq!(store.list_entities("p", FAILED_STATE).expect("list"), vec!["x"]);
    }

    #[test]
    fn hook_sees_input_entity_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, done]\n    transitions:\n      - {from: new, to: done, cmd: ./hook.sh}\n",
        );
        write_entities(temp.path(), "p/new", &["a"]);

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .expect("run");

        let invocations = hooks.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(
            invocations[0].extra_env[INPUT_ENTITY_VAR],
            temp.path().join("p/new/a").display().to_string()
        );
    }

    #[test]
    fn chained_rules_reach_fixpoint_in_one_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, mid, done]\n    transitions:\n      - {from: new, to: mid}\n      - {from: mid, to: done}\n",
        );
        write_entities(temp.path(), "p/new", &["a"]);

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        let moved = runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .expect("run");

        // new->mid and mid->done both land in the same pass.
        assert_eq!(moved, 2);
        assert_eq!(store.list_entities("p", "done").expect("list"), vec!["a"]);
    }

    #[test]
    fn jumps_fire_in_entity_start_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, done]\n    transitions:\n      - {from: new, to: done, jump: q}\n  q: {states: [s]}\n",
        );
        write_entities(temp.path(), "p/new", &["01-a", "01-b", "02-c"]);

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        let mut jumps = Vec::new();
        runner
            .run_phase(&config.phases[0], &mut |target: &str| {
                jumps.push(target.to_string());
                Ok(())
            })
            .expect("run");

        assert_eq!(jumps, vec!["q", "q", "q"]);
    }

    #[test]
    fn entity_mode_drives_one_entity_to_rest_at_a_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, mid, done]\n    mode: entity\n    transitions:\n      - {from: new, to: mid, cmd: ./hook.sh}\n      - {from: mid, to: done, cmd: ./hook.sh}\n",
        );
        write_entities(temp.path(), "p/new", &["a", "b"]);

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        let moved = runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .expect("run");

        assert_eq!(moved, 4);
        let labels: Vec<String> = hooks
            .invocations()
            .iter()
            .map(|inv| inv.label.clone())
            .collect();
        assert_eq!(
            labels,
            vec![
                "transition hook p:new->mid entity=a",
                "transition hook p:mid->done entity=a",
                "transition hook p:new->mid entity=b",
                "transition hook p:mid->done entity=b",
            ]
        );
    }

    #[test]
    fn entity_mode_leaves_unmatched_entities_at_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, done]\n    mode: entity\n    transitions:\n      - {from: new, to: done}\n",
        );
        write_entities(temp.path(), "p/new", &["a"]);
        write_entities(temp.path(), "p/done", &["settled"]);

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        let moved = runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .expect("run");

        assert_eq!(moved, 1);
        assert_eq!(
            store.list_entities("p", "done").expect("list"),
            vec!["a", "settled"]
        );
    }

    #[test]
    fn completion_hooks_run_after_fixpoint_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [s]\n    completions:\n      - echo one\n      - echo two\n",
        );

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .expect("run");

        let labels: Vec<String> = hooks
            .invocations()
            .iter()
            .map(|inv| inv.label.clone())
            .collect();
        assert_eq!(labels, vec!["completion hook p[1]", "completion hook p[2]"]);
    }

    #[test]
    fn exhausted_completion_hook_aborts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [s]\n    completions:\n      - ./flaky.sh\n",
        );

        let hooks = ScriptedHookRunner::always(HookStatus::Exhausted);
        let runner = PhaseRunner::new(&store, &hooks);
        let err = runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .unwrap_err();
        let exhausted = err
            .downcast_ref::<HookExhaustedError>()
            .expect("typed error");
        assert_eq!(exhausted.label, "completion hook p[1]");
    }

    #[test]
    fn fs_dust_is_ignored_during_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (config, store) = setup(
            &temp,
            "phases:\n  p:\n    states: [new, done]\n    transitions:\n      - {from: new, to: done}\n",
        );
        write_entities(temp.path(), "p/new", &["a"]);
        fs::write(temp.path().join("p/new/.hidden"), "").expect("write");

        let hooks = ScriptedHookRunner::always(HookStatus::Success);
        let runner = PhaseRunner::new(&store, &hooks);
        let moved = runner
            .run_phase(&config.phases[0], &mut no_jumps())
            .expect("run");

        assert_eq!(moved, 1);
        assert!(temp.path().join("p/new/.hidden").exists());
    }
}
