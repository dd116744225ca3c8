//! Stdin template rendering for hooks.
//!
//! Templates see only orchestrator-defined variables (the workflow `env`
//! entries and the `DIR_*` directory map), never the inherited process
//! environment. Two helpers are registered: `read_file(path)` and its alias
//! `include_file(path)`, which read UTF-8 text with relative paths resolved
//! against the workflow root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::value::Value;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};

pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new(root: &Path) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        let read_root = root.to_path_buf();
        env.add_function("read_file", move |path: String| {
            read_file_helper(&read_root, &path)
        });
        let include_root = root.to_path_buf();
        env.add_function("include_file", move |path: String| {
            read_file_helper(&include_root, &path)
        });

        Self { env }
    }

    /// Render `template` against `vars`.
    ///
    /// Each variable is exposed at the top level and the full mapping is
    /// additionally reachable as `env`, so `{{ INPUT_ENTITY }}` and
    /// `{{ env.INPUT_ENTITY }}` are equivalent.
    pub fn render(&self, template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
        let mut context: BTreeMap<&str, Value> = vars
            .iter()
            .map(|(key, value)| (key.as_str(), Value::from(value.as_str())))
            .collect();
        context.insert("env", Value::from_serialize(vars));

        self.env
            .render_str(template, &context)
            .context("render template")
    }
}

fn read_file_helper(root: &Path, raw: &str) -> Result<String, minijinja::Error> {
    if raw.is_empty() {
        return Err(minijinja::Error::new(
            ErrorKind::InvalidOperation,
            "read_file/include_file path must be a non-empty string",
        ));
    }
    let mut path = PathBuf::from(raw);
    if path.is_relative() {
        path = root.join(path);
    }
    fs::read_to_string(&path).map_err(|err| {
        minijinja::Error::new(
            ErrorKind::InvalidOperation,
            format!("unable to read file '{}': {err}", path.display()),
        )
    })
}
