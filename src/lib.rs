#![warn(
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::if_then_some_else_none,
    clippy::implicit_clone,
    clippy::redundant_else,
    clippy::single_match_else,
    clippy::try_err,
    clippy::unreadable_literal
)]

//! This crate is the library underneath the `ctenv` command-line program.
//!
//! `ctenv` runs a command inside an OCI container (docker or podman) while
//! mirroring the invoking host user into it: same uid and gid, same user
//! and group names, same home path, and mounts arranged so that the
//! project directory keeps its absolute host path by default. Files
//! created inside the container come out owned by the invoking user.
//!
//! The pipeline is linear: capture a runtime context, load and merge
//! configuration layers ([`config`]), substitute `${...}` variables,
//! resolve everything into an executable container spec, generate the
//! privilege-dropping entrypoint script, and hand an argument vector to
//! the runtime ([`runtime`]).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub mod cli;
pub mod config;
pub mod context;
pub mod entrypoint;
pub mod newtype;
pub mod runtime;
pub mod spec;
pub mod template;
pub mod volume;

use config::{ConfigStack, ContainerConfig, Setting};
use context::RuntimeContext;
use newtype::HostPath;

/// The program state shared by every subcommand: the host snapshot and the
/// loaded configuration stack.
pub struct Ctenv {
    ctx: RuntimeContext,
    stack: ConfigStack,
}

impl Ctenv {
    /// Captures the runtime context and loads the config files.
    /// `explicit_configs` (from `--config`) replace discovery entirely;
    /// relative paths in both arguments resolve against the cwd.
    pub fn new(explicit_configs: &[PathBuf], project_dir: Option<PathBuf>) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to get current directory")?;

        let project_dir = match project_dir {
            Some(dir) => Some(HostPath::try_from(cwd.join(dir))?),
            None => None,
        };
        let ctx = RuntimeContext::capture(project_dir)?;

        let explicit: Vec<HostPath> = explicit_configs
            .iter()
            .map(|path| HostPath::try_from(cwd.join(path)))
            .collect::<Result<_>>()?;
        let (stack, project_file) = ConfigStack::load(&explicit, &ctx.user_home, &ctx.cwd)?;
        if let Some(path) = project_file {
            tracing::debug!("using project config {path}");
        }

        Ok(Self { ctx, stack })
    }

    pub fn cwd(&self) -> &HostPath {
        &self.ctx.cwd
    }

    /// Merges all layers for `name` (or the `default = true` container) and
    /// substitutes variables. Returns the merged record and the effective
    /// project directory.
    fn effective(
        &self,
        name: Option<&str>,
        cli_layer: &ContainerConfig,
    ) -> Result<(ContainerConfig, HostPath)> {
        let selected = match name {
            Some(name) => Some(name.to_owned()),
            None => self.stack.default_container()?,
        };
        if let Some(name) = &selected {
            tracing::debug!("using container {name}");
        }
        let mut merged = self.stack.effective(selected.as_deref(), cli_layer)?;

        // The project directory may itself come from a config layer; it
        // only gets context and env variables, since it is a variable for
        // everything else.
        let project_dir = match merged.project_dir.value() {
            Some(dir) => {
                let vars = self.ctx.vars(&self.ctx.project_dir);
                let expanded = template::expand("project_dir", dir, &vars)?;
                HostPath::try_from(expanded.as_str())
                    .with_context(|| format!("project_dir {expanded:?} is not absolute"))?
            }
            None => self.ctx.project_dir.clone(),
        };
        merged.project_dir = Setting::Set(project_dir.display().to_string());

        let vars = self.ctx.vars(&project_dir);
        template::expand_record(&mut merged, &vars)?;
        Ok((merged, project_dir))
    }

    /// `ctenv run`: the whole pipeline. Returns the exit code to terminate
    /// with, which is the runtime child's own exit code.
    pub fn run(
        &self,
        name: Option<&str>,
        cli_layer: &ContainerConfig,
        dry_run: bool,
    ) -> Result<i32> {
        let (merged, _) = self.effective(name, cli_layer)?;
        let spec = spec::resolve(&merged, &self.ctx)?;
        runtime::execute(&spec, dry_run)
    }

    /// `ctenv build`: resolve and build the image without running.
    pub fn build(
        &self,
        name: Option<&str>,
        cli_layer: &ContainerConfig,
        dry_run: bool,
    ) -> Result<()> {
        let (merged, project_dir) = self.effective(name, cli_layer)?;
        let (_, build) = spec::resolve_image_and_build(&merged, &project_dir)?;
        let Some(build) = build else {
            match name {
                Some(name) => bail!("container {name:?} has no build section"),
                None => bail!("nothing to build: no build section configured"),
            }
        };
        let runtime = merged
            .runtime
            .value()
            .copied()
            .unwrap_or(runtime::Runtime::Docker);
        runtime::build_image(runtime, &build, dry_run)
    }

    /// `ctenv config show`: print the effective record as TOML (or JSON),
    /// with unset fields elided and cleared fields rendered as `"NOTSET"`.
    pub fn show_config(
        &self,
        name: Option<&str>,
        cli_layer: &ContainerConfig,
        json: bool,
    ) -> Result<()> {
        let (merged, _) = self.effective(name, cli_layer)?;
        if json {
            let rendered = serde_json::to_string_pretty(&merged)
                .context("failed to serialize the effective configuration")?;
            println!("{rendered}");
        } else {
            let rendered = toml::to_string_pretty(&merged)
                .context("failed to serialize the effective configuration")?;
            print!("{rendered}");
        }
        Ok(())
    }
}
