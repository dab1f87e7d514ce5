//! Translates the merged, substituted configuration plus the runtime
//! context into a [`ContainerSpec`]: no unset fields, no template hooks,
//! every path absolute. The runtime driver and the entrypoint generator
//! consume this and nothing else.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::{ContainerConfig, TtyMode, UlimitValue};
use crate::context::RuntimeContext;
use crate::newtype::{self, ContainerPath, HostPath};
use crate::runtime::Runtime;
use crate::template::slug;
use crate::volume::{self, VolumeOpt, VolumeSpec};

newtype::name!(ContainerName);

/// Fixed in-container locations for the tool's own mounts.
pub const GOSU_MOUNT_PATH: &str = "/ctenv/gosu";
pub const ENTRYPOINT_MOUNT_PATH: &str = "/ctenv/entrypoint.sh";

/// What the host side of a mount is: a filesystem path or a named volume
/// managed by the runtime.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeSource {
    Path(HostPath),
    Named(String),
}

impl VolumeSource {
    fn as_arg(&self) -> String {
        match self {
            VolumeSource::Path(path) => path.display().to_string(),
            VolumeSource::Named(name) => name.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedVolume {
    pub source: VolumeSource,
    pub container: ContainerPath,
    pub options: Vec<VolumeOpt>,
}

impl ResolvedVolume {
    pub fn chown(&self) -> bool {
        self.options.contains(&VolumeOpt::Chown)
    }

    /// The `--volume` argument for the runtime. `chown` is consumed by the
    /// entrypoint generator and stripped here.
    pub fn runtime_arg(&self) -> String {
        let opts: Vec<&str> = self
            .options
            .iter()
            .filter(|o| **o != VolumeOpt::Chown)
            .map(|o| o.as_str())
            .collect();
        if opts.is_empty() {
            format!("{}:{}", self.source.as_arg(), self.container)
        } else {
            format!("{}:{}:{}", self.source.as_arg(), self.container, opts.join(","))
        }
    }
}

/// One `env` entry: an explicit value or a pass-through of the host value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnvEntry {
    Set { name: String, value: String },
    Passthrough { name: String },
}

impl EnvEntry {
    pub fn parse(entry: &str) -> Result<Self> {
        let parsed = match entry.split_once('=') {
            Some((name, value)) => EnvEntry::Set {
                name: name.to_owned(),
                value: value.to_owned(),
            },
            None => EnvEntry::Passthrough {
                name: entry.to_owned(),
            },
        };
        if parsed.name().is_empty() {
            bail!("invalid env entry {entry:?}: empty variable name");
        }
        Ok(parsed)
    }

    pub fn name(&self) -> &str {
        match self {
            EnvEntry::Set { name, .. } | EnvEntry::Passthrough { name } => name,
        }
    }

    pub fn runtime_arg(&self) -> String {
        match self {
            EnvEntry::Set { name, value } => format!("{name}={value}"),
            EnvEntry::Passthrough { name } => name.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildSource {
    File(HostPath),
    Inline(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildContext {
    Dir(HostPath),
    Empty,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedBuild {
    pub source: BuildSource,
    pub context: BuildContext,
    pub tag: String,
    pub args: BTreeMap<String, String>,
    pub platform: Option<String>,
}

/// The fully-resolved invocation. Identity fields are copied from the
/// runtime context so the generator and driver need nothing else.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub runtime: Runtime,
    pub image: String,
    pub build: Option<ResolvedBuild>,
    pub command: String,
    pub container_name: ContainerName,
    pub project_dir: HostPath,
    pub project_target: ContainerPath,
    pub workdir: ContainerPath,
    pub volumes: Vec<ResolvedVolume>,
    pub env: Vec<EnvEntry>,
    pub network: Option<String>,
    pub platform: Option<String>,
    pub ulimits: Vec<(String, String)>,
    pub tty: bool,
    pub sudo: bool,
    pub gosu_path: HostPath,
    pub run_args: Vec<String>,
    pub post_start_commands: Vec<String>,
    pub user_name: String,
    pub user_id: u32,
    pub group_name: String,
    pub group_id: u32,
    pub user_home: String,
}

impl ContainerSpec {
    pub fn env_names_ps1(&self) -> bool {
        self.env.iter().any(|e| e.name() == "PS1")
    }
}

/// Resolves the merged record. `config` has been substituted already; any
/// `${` left in it at this point is literal text.
pub fn resolve(config: &ContainerConfig, ctx: &RuntimeContext) -> Result<ContainerSpec> {
    let project_dir = match config.project_dir.value() {
        Some(dir) => HostPath::try_from(dir.as_str())
            .with_context(|| format!("project_dir {dir:?} is not absolute"))?,
        None => ctx.project_dir.clone(),
    };

    let (image, build) = resolve_image_and_build(config, &project_dir)?;

    let (project_target, target_options) = match config.project_target.value() {
        Some(spec) => {
            let (path, options) = volume::parse_target_spec(spec)
                .with_context(|| format!("invalid project_target {spec:?}"))?;
            let path = ContainerPath::try_from(path.as_str())
                .with_context(|| format!("project_target {path:?} is not absolute"))?;
            (path, options)
        }
        None => (
            ContainerPath::try_from(project_dir.as_path().to_owned())
                .context("project directory is not absolute")?,
            Vec::new(),
        ),
    };

    let mut volumes = Vec::new();
    let auto_project_mount = config.auto_project_mount.value().copied().unwrap_or(true);
    let subpaths = config
        .subpaths
        .value()
        .map(Vec::as_slice)
        .unwrap_or_default();
    if auto_project_mount {
        if !subpaths.is_empty() {
            tracing::warn!(
                "subpaths are ignored while auto_project_mount is enabled; \
                 set auto_project_mount = false to mount only the subpaths"
            );
        }
        volumes.push(ResolvedVolume {
            source: VolumeSource::Path(project_dir.clone()),
            container: project_target.clone(),
            options: target_options,
        });
    } else {
        for spec in subpaths {
            volumes.push(resolve_subpath(spec, &project_dir, &project_target)?);
        }
    }

    for spec in config.volumes.value().map(Vec::as_slice).unwrap_or_default() {
        volumes.push(resolve_volume(spec, ctx, &project_dir, &project_target)?);
    }

    let workdir = resolve_workdir(
        config.workdir.value().map(String::as_str).unwrap_or("auto"),
        ctx,
        &project_dir,
        &project_target,
    )?;
    warn_if_outside_mounts(&workdir, &volumes);

    let platform = config.platform.value().cloned();
    let gosu_path = resolve_gosu(
        config.gosu_path.value().map(String::as_str).unwrap_or("auto"),
        platform.as_deref(),
    )?;

    let container_name = match config.container_name.value() {
        Some(name) if !name.is_empty() => ContainerName::new(name.clone()),
        _ => ContainerName::new(default_container_name(&project_dir, ctx.pid)),
    };

    let tty = config
        .tty
        .value()
        .copied()
        .unwrap_or(TtyMode::Auto)
        .resolve(ctx.tty);

    let ulimits = config
        .ulimits
        .value()
        .map(|map| {
            map.iter()
                .map(|(name, value)| (name.clone(), value.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut env = Vec::new();
    for entry in config.env.value().map(Vec::as_slice).unwrap_or_default() {
        env.push(EnvEntry::parse(entry)?);
    }

    Ok(ContainerSpec {
        runtime: config.runtime.value().copied().unwrap_or(Runtime::Docker),
        image,
        build,
        command: config
            .command
            .value()
            .cloned()
            .unwrap_or_else(|| String::from("/bin/sh")),
        container_name,
        project_dir,
        project_target,
        workdir,
        volumes,
        env,
        network: config.network.value().cloned(),
        platform,
        ulimits,
        tty,
        sudo: config.sudo.value().copied().unwrap_or(false),
        gosu_path,
        run_args: config.run_args.value().cloned().unwrap_or_default(),
        post_start_commands: config.post_start_commands.value().cloned().unwrap_or_default(),
        user_name: ctx.user_name.clone(),
        user_id: ctx.user_id,
        group_name: ctx.group_name.clone(),
        group_id: ctx.group_id,
        user_home: ctx.user_home.display().to_string(),
    })
}

/// Shared with `ctenv build`, which wants the build plan without the rest
/// of the run resolution.
pub(crate) fn resolve_image_and_build(
    config: &ContainerConfig,
    project_dir: &HostPath,
) -> Result<(String, Option<ResolvedBuild>)> {
    let image = config.image.value();
    let build = config.build.value();

    match (image, build) {
        (Some(_), Some(_)) => {
            bail!("image and build are mutually exclusive; configure one of them")
        }
        (None, None) => bail!("no image configured: set image or a build section"),
        (Some(image), None) => Ok((image.clone(), None)),
        (None, Some(build)) => {
            let source = match (build.dockerfile.value(), build.dockerfile_content.value()) {
                (Some(_), Some(_)) => {
                    bail!("build.dockerfile and build.dockerfile_content are mutually exclusive")
                }
                (None, None) => {
                    bail!("build requires one of build.dockerfile or build.dockerfile_content")
                }
                (Some(path), None) => {
                    let path = HostPath::try_from(path.as_str())
                        .with_context(|| format!("build.dockerfile {path:?} is not absolute"))?;
                    if !path.as_path().is_file() {
                        bail!("dockerfile {path} does not exist");
                    }
                    BuildSource::File(path)
                }
                (None, Some(content)) => {
                    if content.trim().is_empty() {
                        bail!("build.dockerfile_content is empty");
                    }
                    BuildSource::Inline(content.clone())
                }
            };

            let context = match build.context.value().map(String::as_str) {
                Some("-") => BuildContext::Empty,
                Some(dir) => {
                    let dir = HostPath::try_from(dir)
                        .with_context(|| format!("build.context {dir:?} is not absolute"))?;
                    if !dir.as_path().is_dir() {
                        bail!("build context {dir} does not exist");
                    }
                    BuildContext::Dir(dir)
                }
                // The loader fills in the layer-origin default; a record
                // built without it falls back to the project directory.
                None => BuildContext::Dir(project_dir.clone()),
            };

            let tag = build
                .tag
                .value()
                .cloned()
                .unwrap_or_else(|| format!("ctenv-{}", slug(&project_dir.display().to_string())));

            Ok((
                tag.clone(),
                Some(ResolvedBuild {
                    source,
                    context,
                    tag,
                    args: build.args.value().cloned().unwrap_or_default(),
                    platform: config.platform.value().cloned(),
                }),
            ))
        }
    }
}

fn resolve_subpath(
    spec: &str,
    project_dir: &HostPath,
    project_target: &ContainerPath,
) -> Result<ResolvedVolume> {
    let parsed: VolumeSpec = spec
        .parse()
        .with_context(|| format!("invalid subpath spec {spec:?}"))?;
    if !parsed.host_is_path() {
        bail!("subpath {spec:?} must be a path under the project directory");
    }
    let host = HostPath::try_from(parsed.host.as_str())
        .with_context(|| format!("subpath {spec:?} did not resolve to an absolute path"))?;
    let rel = host.relative_to(project_dir).ok_or_else(|| {
        anyhow!(
            "subpath {host} is outside the project directory {project_dir}"
        )
    })?;
    if !host.as_path().exists() {
        bail!("subpath {host} does not exist");
    }
    let container = match &parsed.container {
        Some(path) => ContainerPath::try_from(path.as_str())
            .with_context(|| format!("container path in subpath {spec:?} is not absolute"))?,
        None => project_target.join(rel),
    };
    Ok(ResolvedVolume {
        source: VolumeSource::Path(host),
        container,
        options: parsed.options,
    })
}

fn resolve_volume(
    spec: &str,
    ctx: &RuntimeContext,
    project_dir: &HostPath,
    project_target: &ContainerPath,
) -> Result<ResolvedVolume> {
    let parsed: VolumeSpec = spec
        .parse()
        .with_context(|| format!("invalid volume spec {spec:?}"))?;

    let source = if parsed.host_is_path() {
        // Substitution can reintroduce a relative path; those resolve
        // against the invocation cwd.
        let host = if parsed.host.starts_with('/') {
            HostPath::try_from(parsed.host.as_str())?
        } else {
            ctx.cwd.join(&parsed.host)
        };
        VolumeSource::Path(host)
    } else {
        VolumeSource::Named(parsed.host.clone())
    };

    let container = match (&parsed.container, &source) {
        (Some(path), _) => ContainerPath::try_from(path.as_str())
            .with_context(|| format!("container path in volume {spec:?} is not absolute"))?,
        (None, VolumeSource::Path(host)) => match host.relative_to(project_dir) {
            // Paths under the project move with the project mount; others
            // mount at their own host location.
            Some(rel) => project_target.join(rel),
            None => ContainerPath::try_from(host.as_path().to_owned())?,
        },
        (None, VolumeSource::Named(name)) => {
            bail!("named volume {name:?} needs an explicit container path")
        }
    };

    Ok(ResolvedVolume {
        source,
        container,
        options: parsed.options,
    })
}

fn resolve_workdir(
    workdir: &str,
    ctx: &RuntimeContext,
    project_dir: &HostPath,
    project_target: &ContainerPath,
) -> Result<ContainerPath> {
    if workdir == "auto" {
        return Ok(match ctx.cwd.relative_to(project_dir) {
            Some(rel) => project_target.join(rel),
            None => project_target.clone(),
        });
    }
    ContainerPath::try_from(workdir)
        .with_context(|| format!("workdir {workdir:?} is not an absolute in-container path"))
}

fn warn_if_outside_mounts(workdir: &ContainerPath, volumes: &[ResolvedVolume]) {
    let covered = volumes.iter().any(|v| workdir.starts_with(&v.container));
    if !covered {
        tracing::warn!(
            "workdir {workdir} is not under any mount point; \
             files created there stay in the container"
        );
    }
}

fn default_container_name(project_dir: &HostPath, pid: u32) -> String {
    format!("ctenv-{}-{pid}", slug(&project_dir.display().to_string()))
}

fn host_arch() -> Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("amd64"),
        "aarch64" => Ok("arm64"),
        other => Err(anyhow!("no bundled gosu binary for host architecture {other}")),
    }
}

fn platform_arch(platform: &str) -> Result<&'static str> {
    let arch = platform.split_once('/').map_or(platform, |(_, arch)| arch);
    match arch {
        "amd64" | "x86_64" => Ok("amd64"),
        "arm64" | "aarch64" => Ok("arm64"),
        other => Err(anyhow!("no bundled gosu binary for platform architecture {other}")),
    }
}

fn resolve_gosu(gosu_path: &str, platform: Option<&str>) -> Result<HostPath> {
    let path = if gosu_path == "auto" {
        let arch = match platform {
            Some(platform) => platform_arch(platform)?,
            None => host_arch()?,
        };
        let exe = std::env::current_exe().context("failed to locate the ctenv executable")?;
        let dir = exe
            .parent()
            .ok_or_else(|| anyhow!("executable path {exe:?} has no parent directory"))?;
        HostPath::try_from(dir.join(format!("gosu-{arch}")))?
    } else {
        HostPath::try_from(gosu_path)
            .with_context(|| format!("gosu_path {gosu_path:?} is not absolute"))?
    };
    if !path.as_path().is_file() {
        bail!("gosu helper not found at {path}");
    }
    Ok(path)
}
