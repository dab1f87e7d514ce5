//! Builds the runtime argument vector and runs it in the foreground.
//!
//! The container always starts as root with `/bin/sh` running the generated
//! entrypoint script; the script performs the identity setup and privilege
//! drop. The tool's stdin/stdout/stderr are handed to the child untouched
//! and its exit status becomes ours.

use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::entrypoint;
use crate::spec::{
    BuildContext, BuildSource, ContainerSpec, ResolvedBuild, ENTRYPOINT_MOUNT_PATH,
    GOSU_MOUNT_PATH,
};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Docker,
    Podman,
}

impl Runtime {
    pub fn command(&self) -> &'static str {
        match self {
            Runtime::Docker => "docker",
            Runtime::Podman => "podman",
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command())
    }
}

fn spawn_error(runtime: Runtime, err: std::io::Error) -> anyhow::Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        anyhow!(
            "runtime {} not found on PATH: {err}",
            runtime.command()
        )
    } else {
        anyhow::Error::from(err).context(format!("failed to run {}", runtime.command()))
    }
}

/// Rootless podman needs `--userns=keep-id` so the mirrored uid maps onto
/// the invoking user instead of a subuid.
fn podman_is_rootless() -> bool {
    let output = Command::new(Runtime::Podman.command())
        .args(["info", "--format", "{{ .Host.Security.Rootless -}}"])
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout)
                .trim()
                .eq_ignore_ascii_case("true")
        }
        _ => {
            tracing::warn!("failed to detect whether podman is rootless; assuming rootful");
            false
        }
    }
}

/// One shell-pasteable line for `--dry-run` output.
fn format_command(program: &str, args: &[String]) -> String {
    shlex::join(std::iter::once(program).chain(args.iter().map(String::as_str)))
}

fn build_args_for(build: &ResolvedBuild, context_dir: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![String::from("build")];
    if let Some(platform) = &build.platform {
        args.push(format!("--platform={platform}"));
    }
    args.push(format!("--tag={}", build.tag));
    for (key, value) in &build.args {
        args.push(String::from("--build-arg"));
        args.push(format!("{key}={value}"));
    }
    match &build.source {
        BuildSource::File(path) => {
            args.push(String::from("--file"));
            args.push(path.display().to_string());
        }
        BuildSource::Inline(_) => {
            args.push(String::from("--file"));
            args.push(String::from("-"));
        }
    }
    args.push(context_dir.to_owned());
    args
}

/// Runs (or prints) the build. The build always precedes the run; its tag
/// is the image the run uses.
pub fn build_image(runtime: Runtime, build: &ResolvedBuild, dry_run: bool) -> Result<()> {
    // An inline dockerfile with the "-" context builds against a fresh
    // empty directory, removed again when this function returns.
    let mut _empty_context: Option<tempfile::TempDir> = None;
    let context_dir = match &build.context {
        BuildContext::Dir(dir) => dir.display().to_string(),
        BuildContext::Empty => {
            let dir = tempfile::Builder::new()
                .prefix("ctenv-build-context-")
                .tempdir()
                .context("failed to create an empty build context")?;
            let path = dir.path().display().to_string();
            _empty_context = Some(dir);
            path
        }
    };

    let args = build_args_for(build, &context_dir);
    if dry_run {
        println!("{}", format_command(runtime.command(), &args));
        return Ok(());
    }

    tracing::debug!("running {}", format_command(runtime.command(), &args));
    let mut command = Command::new(runtime.command());
    command.args(&args);
    if matches!(build.source, BuildSource::Inline(_)) {
        command.stdin(Stdio::piped());
    }
    let mut child = command.spawn().map_err(|e| spawn_error(runtime, e))?;
    if let BuildSource::Inline(content) = &build.source {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open stdin of {} build", runtime))?;
        stdin
            .write_all(content.as_bytes())
            .context("failed to write the dockerfile to the build's stdin")?;
        // Dropping stdin closes the pipe so the build can proceed.
    }
    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {} build", runtime))?;
    if !status.success() {
        bail!(
            "failed to build image {}: {} build exited with status {:?}",
            build.tag,
            runtime,
            status.code(),
        );
    }
    Ok(())
}

/// Assembles the full `run` argument vector. Pure, for the dry-run output
/// and the tests; `execute` feeds it to the real runtime.
pub fn run_args_for(
    spec: &ContainerSpec,
    entrypoint_path: &Path,
    rootless_podman: bool,
) -> Vec<String> {
    let mut args: Vec<String> = ["run", "--rm", "--init", "--user=root"]
        .into_iter()
        .map(String::from)
        .collect();

    args.push(format!("--name={}", spec.container_name));
    args.push(String::from(if spec.tty { "-it" } else { "-i" }));
    if spec.runtime == Runtime::Podman && rootless_podman {
        args.push(String::from("--userns=keep-id"));
    }
    if let Some(platform) = &spec.platform {
        args.push(format!("--platform={platform}"));
    }
    if let Some(network) = &spec.network {
        args.push(format!("--network={network}"));
    }
    for (name, value) in &spec.ulimits {
        args.push(String::from("--ulimit"));
        args.push(format!("{name}={value}"));
    }
    for volume in &spec.volumes {
        args.push(format!("--volume={}", volume.runtime_arg()));
    }
    args.push(format!(
        "--volume={}:{}:ro",
        spec.gosu_path.display(),
        GOSU_MOUNT_PATH
    ));
    args.push(format!(
        "--volume={}:{}:ro",
        entrypoint_path.display(),
        ENTRYPOINT_MOUNT_PATH
    ));
    args.push(format!("--workdir={}", spec.workdir));
    for entry in &spec.env {
        args.push(String::from("-e"));
        args.push(entry.runtime_arg());
    }
    args.push(String::from("--entrypoint=/bin/sh"));
    args.extend(spec.run_args.iter().cloned());
    args.push(String::from("--label=se.osd.ctenv.managed=true"));
    args.push(spec.image.clone());
    args.push(String::from(ENTRYPOINT_MOUNT_PATH));
    args
}

fn forwarded_exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        // Terminated by signal N: report it shell-style.
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Builds (when requested) and runs the container, returning the exit code
/// this process should terminate with.
pub fn execute(spec: &ContainerSpec, dry_run: bool) -> Result<i32> {
    if let Some(build) = &spec.build {
        build_image(spec.runtime, build, dry_run)?;
    }

    // The script lives in a temp file bind-mounted read-only into the
    // container; the file is removed when this function returns.
    let mut script_file = tempfile::Builder::new()
        .prefix("ctenv-entrypoint-")
        .suffix(".sh")
        .tempfile()
        .context("failed to create the entrypoint temp file")?;
    script_file
        .write_all(entrypoint::render_entrypoint(spec).as_bytes())
        .context("failed to write the entrypoint script")?;
    script_file
        .flush()
        .context("failed to write the entrypoint script")?;

    let rootless = spec.runtime == Runtime::Podman && podman_is_rootless();
    let args = run_args_for(spec, script_file.path(), rootless);

    if dry_run {
        println!("{}", format_command(spec.runtime.command(), &args));
        return Ok(0);
    }

    tracing::debug!("running {}", format_command(spec.runtime.command(), &args));
    let status = Command::new(spec.runtime.command())
        .args(&args)
        .status()
        .map_err(|e| spawn_error(spec.runtime, e))?;
    Ok(forwarded_exit_code(status))
}
