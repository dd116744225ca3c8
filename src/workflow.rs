//! Workflow engine: phase scheduling, jump recursion, and termination.
//!
//! Phases are visited in declaration order with wraparound. Each visit runs
//! the phase to fixpoint; the run ends the first time the first phase is
//! entered after a wrap and produces zero moves. Jumps recurse into other
//! phases without touching the persisted cursor.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::config::{PhaseConfig, WorkflowConfig};
use crate::hooks::{HookExhaustedError, HookRunner, HookStatus};
use crate::phase::PhaseRunner;
use crate::state::RuntimeStateStore;
use crate::store::EntityStore;

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Jump nesting depth beyond which each further level logs a warning.
    /// Cycles are not detected; this is the only guard rail.
    pub jump_depth_warn: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            jump_depth_warn: 32,
        }
    }
}

pub struct WorkflowEngine<'a, H: HookRunner> {
    config: &'a WorkflowConfig,
    store: &'a EntityStore,
    state: &'a RuntimeStateStore,
    hooks: &'a H,
    options: EngineOptions,
}

impl<'a, H: HookRunner> WorkflowEngine<'a, H> {
    pub fn new(
        config: &'a WorkflowConfig,
        store: &'a EntityStore,
        state: &'a RuntimeStateStore,
        hooks: &'a H,
        options: EngineOptions,
    ) -> Self {
        Self {
            config,
            store,
            state,
            hooks,
            options,
        }
    }

    /// Run the workflow until the termination rule fires.
    pub fn run(&self) -> Result<()> {
        self.store.ensure_layout()?;

        let loaded = self.state.load();
        let mut index = match &loaded {
            Some(name) => match self.config.phase_index(name) {
                Some(index) => {
                    info!(phase = %name, "resuming at persisted phase");
                    index
                }
                None => {
                    warn!(
                        phase = %name,
                        "state file references an unknown phase; starting from the first phase"
                    );
                    0
                }
            },
            None => 0,
        };

        // The init hook belongs to the first-ever run only; a resumed run
        // (even one pointed at a vanished phase) skips it.
        if loaded.is_none() {
            self.run_init()?;
        }

        let runner = PhaseRunner::new(self.store, self.hooks);
        let mut wrapped_to_first = false;
        loop {
            let phase = &self.config.phases[index];
            info!(phase = %phase.name, "starting phase");
            self.state.save(&phase.name)?;

            let moved = self.run_phase_with_jumps(&runner, phase, 0)?;

            if wrapped_to_first && index == 0 && moved == 0 {
                info!(phase = %phase.name, "reached stable fixpoint at first phase; exiting");
                return Ok(());
            }

            index = (index + 1) % self.config.phases.len();
            if index == 0 {
                wrapped_to_first = true;
            }
        }
    }

    fn run_phase_with_jumps(
        &self,
        runner: &PhaseRunner<'_, H>,
        phase: &PhaseConfig,
        depth: usize,
    ) -> Result<u64> {
        runner.run_phase(phase, &mut move |target: &str| {
            self.run_jump(runner, target, &phase.name, depth)
        })
    }

    fn run_jump(
        &self,
        runner: &PhaseRunner<'_, H>,
        target: &str,
        source: &str,
        depth: usize,
    ) -> Result<()> {
        if target == source {
            warn!(phase = %source, "ignoring self-jump");
            return Ok(());
        }
        let target_phase = self
            .config
            .phase(target)
            .ok_or_else(|| anyhow!("jump target '{target}' is not a declared phase"))?;

        let depth = depth + 1;
        if depth > self.options.jump_depth_warn {
            warn!(
                depth,
                from = %source,
                to = %target,
                "jump nesting exceeds threshold; possible jump cycle"
            );
        }

        info!(from = %source, to = %target, "entering jump");
        self.run_phase_with_jumps(runner, target_phase, depth)?;
        info!(to = %source, from = %target, "returning from jump");
        Ok(())
    }

    fn run_init(&self) -> Result<()> {
        let Some(hook) = &self.config.init else {
            return Ok(());
        };
        let label = "init hook";
        info!("running init hook");
        if self.hooks.run(hook, &BTreeMap::new(), label)? == HookStatus::Exhausted {
            return Err(HookExhaustedError {
                label: label.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
