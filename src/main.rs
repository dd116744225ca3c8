//! Directory-backed workflow orchestrator CLI.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use dirorch::config::{load_workflow, resolve_workflow_path};
use dirorch::env::HookEnv;
use dirorch::exit_codes;
use dirorch::hooks::{HookExhaustedError, ShellHookRunner};
use dirorch::logging;
use dirorch::state::RuntimeStateStore;
use dirorch::store::EntityStore;
use dirorch::template::TemplateRenderer;
use dirorch::workflow::{EngineOptions, WorkflowEngine};

#[derive(Parser)]
#[command(
    name = "dirorch",
    version,
    about = "Run directory-based workflow orchestration"
)]
struct Cli {
    /// Workflow file path, or a name resolved from
    /// $XDG_CONFIG_DIR/dirorch/workflows/<name>.yml (fallback:
    /// ~/.config/dirorch/workflows/<name>.yml).
    workflow: String,

    /// Root directory for workflow state directories.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Retries for hooks (overrides the workflow's `retries`; the count
    /// excludes the first attempt).
    #[arg(long)]
    retries: Option<u32>,

    /// Runtime state file name under --root.
    #[arg(long, default_value = ".dirorch_runtime.json")]
    state_file: String,

    /// Logging verbosity.
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    if let Err(err) = run(&cli) {
        eprintln!("{:#}", err);
        let code = if err.downcast_ref::<HookExhaustedError>().is_some() {
            exit_codes::HOOK_EXHAUSTED
        } else {
            exit_codes::INVALID
        };
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let workflow_path = resolve_workflow_path(&cli.workflow)?;
    let config = load_workflow(&workflow_path)?;
    let retries = cli.retries.unwrap_or(config.retries);

    // Hooks and DIR_* variables see absolute paths, so pin the root early.
    fs::create_dir_all(&cli.root)
        .with_context(|| format!("create root directory {}", cli.root.display()))?;
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("resolve root directory {}", cli.root.display()))?;

    let renderer = TemplateRenderer::new(&root);
    let hook_env = HookEnv::compose(&config, &root, &renderer, std::env::vars())?;
    let store = EntityStore::new(&root, &config);
    let state = RuntimeStateStore::new(&root, &cli.state_file);
    let hooks = ShellHookRunner::new(root, hook_env, renderer, retries);

    let engine = WorkflowEngine::new(&config, &store, &state, &hooks, EngineOptions::default());
    engine.run()
}
