//! Configuration layers and their merge semantics.
//!
//! A `.ctenv.toml` file has two optional tables: `defaults`, applied to
//! every invocation, and `containers.<name>`, selected by name (or by a
//! `default = true` marker). Files are discovered in the user's home
//! directory and by walking upward from the current directory, or supplied
//! explicitly with `--config`. Each file parses into partial
//! [`ContainerConfig`] records whose fields are three-state
//! [`Setting`] values, so that a layer which says nothing about a field can
//! be told apart from a layer which explicitly clears it.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::fs::MetadataExt;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::newtype::HostPath;
use crate::runtime::Runtime;
use crate::volume::{self, VolumeSpec};

pub const CONFIG_FILE_NAME: &str = ".ctenv.toml";

/// The value of one configuration field in one layer.
///
/// `Unset` means the layer did not mention the field at all and the value
/// accumulated from lower layers survives. `Cleared` is written as the
/// string `"NOTSET"` in a file or on the command line; it is a real value
/// that overrides lower layers, returning the field to "no value".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Setting<T> {
    Unset,
    Cleared,
    Set(T),
}

// Derived Default would demand T: Default for no reason.
impl<T> Default for Setting<T> {
    fn default() -> Self {
        Setting::Unset
    }
}

pub const NOTSET: &str = "NOTSET";

impl<T> Setting<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Setting::Unset)
    }

    /// The concrete value, if one is set. `Cleared` has no value.
    pub fn value(&self) -> Option<&T> {
        match self {
            Setting::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut T> {
        match self {
            Setting::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Setting::Set(v) => Some(v),
            _ => None,
        }
    }

    /// Layers `self` over `lower`: any non-`Unset` value wins, including an
    /// explicit clear.
    pub fn over(&self, lower: &Self) -> Self
    where
        T: Clone,
    {
        match self {
            Setting::Unset => lower.clone(),
            other => other.clone(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = toml::Value::deserialize(deserializer)?;
        if let toml::Value::String(s) = &value {
            if s == NOTSET {
                return Ok(Setting::Cleared);
            }
        }
        value.try_into().map(Setting::Set).map_err(D::Error::custom)
    }
}

impl<T: Serialize> Serialize for Setting<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Setting::Unset => serializer.serialize_none(),
            Setting::Cleared => serializer.serialize_str(NOTSET),
            Setting::Set(v) => v.serialize(serializer),
        }
    }
}

/// The `tty` field accepts `"auto"` as well as plain booleans.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TtyMode {
    Auto,
    On,
    Off,
}

impl TtyMode {
    pub fn resolve(self, stdin_is_tty: bool) -> bool {
        match self {
            TtyMode::Auto => stdin_is_tty,
            TtyMode::On => true,
            TtyMode::Off => false,
        }
    }
}

impl<'de> Deserialize<'de> for TtyMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Bool(bool),
            Text(String),
        }
        match Wire::deserialize(deserializer)? {
            Wire::Bool(true) => Ok(TtyMode::On),
            Wire::Bool(false) => Ok(TtyMode::Off),
            Wire::Text(s) => match s.as_str() {
                "auto" => Ok(TtyMode::Auto),
                "yes" | "true" => Ok(TtyMode::On),
                "no" | "false" => Ok(TtyMode::Off),
                other => Err(D::Error::custom(format!(
                    "tty must be a boolean, \"auto\", \"yes\", or \"no\", got {other:?}"
                ))),
            },
        }
    }
}

impl Serialize for TtyMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TtyMode::Auto => serializer.serialize_str("auto"),
            TtyMode::On => serializer.serialize_bool(true),
            TtyMode::Off => serializer.serialize_bool(false),
        }
    }
}

/// A ulimit value: either a single number or a `soft:hard` pair.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UlimitValue {
    Limit(i64),
    SoftHard(String),
}

impl fmt::Display for UlimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UlimitValue::Limit(n) => n.fmt(f),
            UlimitValue::SoftHard(s) => s.fmt(f),
        }
    }
}

/// One configuration layer. Every field is a [`Setting`]; the record as a
/// whole never resolves anything, it only remembers what this layer said.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    /// Image reference to run. Mutually exclusive with `build`.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub image: Setting<String>,

    /// Command string, interpreted by `/bin/sh -c` inside the container.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub command: Setting<String>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub project_dir: Setting<String>,

    /// In-container mount point for the project directory, optionally with
    /// mount options (`/repo:ro`). Defaults to the project directory's own
    /// host path so absolute build paths stay valid.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub project_target: Setting<String>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub auto_project_mount: Setting<bool>,

    /// Volume specs mounted instead of the whole project when
    /// `auto_project_mount` is off.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub subpaths: Setting<Vec<String>>,

    /// `"auto"` preserves the host's project-relative working directory.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub workdir: Setting<String>,

    /// Path to the privilege-drop helper on the host, or `"auto"` for the
    /// bundled binary matching the target platform.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub gosu_path: Setting<String>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub container_name: Setting<String>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub tty: Setting<TtyMode>,

    /// Install sudo in the container and let the target user use it
    /// without a password.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub sudo: Setting<bool>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub network: Setting<String>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub platform: Setting<String>,

    /// `NAME=VALUE` sets a value, bare `NAME` passes the host value through.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub env: Setting<Vec<String>>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub volumes: Setting<Vec<String>>,

    /// Commands run as root inside the container after identity setup and
    /// before the privilege drop.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub post_start_commands: Setting<Vec<String>>,

    /// Extra arguments appended to the runtime invocation verbatim.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub run_args: Setting<Vec<String>>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub runtime: Setting<Runtime>,

    /// Marks this named container as the one used when no name is given.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub default: Setting<bool>,

    // The table-valued fields sit after every scalar and array so the
    // TOML rendering of the merged record never puts a value after a
    // same-level table.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub ulimits: Setting<BTreeMap<String, UlimitValue>>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub build: Setting<BuildConfig>,

    /// Where this layer came from; `None` for the CLI and built-in layers.
    #[serde(skip)]
    pub config_file_path: Option<HostPath>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Dockerfile path, relative to the config file's directory (or the
    /// cwd when given on the command line).
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub dockerfile: Setting<String>,

    /// Inline dockerfile content, fed to the runtime on stdin.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub dockerfile_content: Setting<String>,

    /// Build context directory; `"-"` means an empty context.
    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub context: Setting<String>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub tag: Setting<String>,

    #[serde(default, skip_serializing_if = "Setting::is_unset")]
    pub args: Setting<BTreeMap<String, String>>,
}

impl ContainerConfig {
    /// Produces a new record with `self` layered over `lower`. Fields are
    /// replaced atomically; there is no deep merge and no list
    /// concatenation.
    pub fn over(&self, lower: &Self) -> Self {
        Self {
            image: self.image.over(&lower.image),
            command: self.command.over(&lower.command),
            project_dir: self.project_dir.over(&lower.project_dir),
            project_target: self.project_target.over(&lower.project_target),
            auto_project_mount: self.auto_project_mount.over(&lower.auto_project_mount),
            subpaths: self.subpaths.over(&lower.subpaths),
            workdir: self.workdir.over(&lower.workdir),
            gosu_path: self.gosu_path.over(&lower.gosu_path),
            container_name: self.container_name.over(&lower.container_name),
            tty: self.tty.over(&lower.tty),
            sudo: self.sudo.over(&lower.sudo),
            network: self.network.over(&lower.network),
            platform: self.platform.over(&lower.platform),
            env: self.env.over(&lower.env),
            volumes: self.volumes.over(&lower.volumes),
            post_start_commands: self.post_start_commands.over(&lower.post_start_commands),
            run_args: self.run_args.over(&lower.run_args),
            runtime: self.runtime.over(&lower.runtime),
            default: self.default.over(&lower.default),
            ulimits: self.ulimits.over(&lower.ulimits),
            build: self.build.over(&lower.build),
            config_file_path: self
                .config_file_path
                .clone()
                .or_else(|| lower.config_file_path.clone()),
        }
    }
}

/// The built-in lowest layer.
pub fn builtin_defaults() -> ContainerConfig {
    ContainerConfig {
        auto_project_mount: Setting::Set(true),
        workdir: Setting::Set(String::from("auto")),
        gosu_path: Setting::Set(String::from("auto")),
        container_name: Setting::Set(String::from("ctenv-${project_dir|slug}-${pid}")),
        tty: Setting::Set(TtyMode::Auto),
        sudo: Setting::Set(false),
        runtime: Setting::Set(Runtime::Docker),
        ..ContainerConfig::default()
    }
}

/// Where a layer's relative paths resolve from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathOrigin {
    /// A config file; paths resolve against the file's directory.
    File,
    /// The command line; paths resolve against the invocation cwd, and a
    /// relative `--workdir` is rejected outright.
    Cli,
}

fn looks_resolvable(value: &str) -> bool {
    value != "auto" && !value.starts_with('/') && !value.contains("${")
}

fn resolve_path_value(value: &str, base: &HostPath) -> String {
    if looks_resolvable(value) {
        base.join(value).display().to_string()
    } else {
        value.to_owned()
    }
}

/// Resolves every relative path in a freshly parsed layer against its
/// origin directory, per the origin rules above. Volume and subpath specs
/// are parsed here too, so a malformed spec fails at load time with the
/// file (or flag) it came from still in hand.
pub fn resolve_layer_paths(
    config: &mut ContainerConfig,
    base: &HostPath,
    origin: PathOrigin,
) -> Result<()> {
    if let Some(dir) = config.project_dir.value_mut() {
        *dir = resolve_path_value(dir, base);
    }

    if let Some(target) = config.project_target.value_mut() {
        let (path, options) = volume::parse_target_spec(target)
            .with_context(|| format!("invalid project_target {target:?}"))?;
        let path = resolve_path_value(&path, base);
        *target = render_target_spec(&path, &options);
    }

    if let Some(workdir) = config.workdir.value_mut() {
        if looks_resolvable(workdir) {
            match origin {
                PathOrigin::File => *workdir = base.join(workdir.as_str()).display().to_string(),
                PathOrigin::Cli => bail!(
                    "--workdir must be \"auto\" or an absolute in-container path, got {workdir:?}"
                ),
            }
        }
    }

    if let Some(gosu) = config.gosu_path.value_mut() {
        *gosu = resolve_path_value(gosu, base);
    }

    for field in [&mut config.volumes, &mut config.subpaths] {
        if let Some(specs) = field.value_mut() {
            for spec in specs {
                *spec = resolve_volume_spec(spec, base)?;
            }
        }
    }

    if let Some(build) = config.build.value_mut() {
        if let Some(dockerfile) = build.dockerfile.value_mut() {
            *dockerfile = resolve_path_value(dockerfile, base);
        }
        if let Some(context) = build.context.value_mut() {
            if context != "-" {
                *context = resolve_path_value(context, base);
            }
        }
        // The context defaults to "." at this layer's origin, and that
        // origin is only known here.
        if build.context.is_unset() {
            build.context = Setting::Set(base.display().to_string());
        }
    }

    Ok(())
}

fn resolve_volume_spec(spec: &str, base: &HostPath) -> Result<String> {
    let mut parsed: VolumeSpec = spec
        .parse()
        .with_context(|| format!("invalid volume spec {spec:?}"))?;
    if parsed.host_is_path() && looks_resolvable(&parsed.host) {
        parsed.host = base.join(&parsed.host).display().to_string();
    }
    Ok(parsed.to_string())
}

fn render_target_spec(path: &str, options: &[volume::VolumeOpt]) -> String {
    if options.is_empty() {
        path.to_owned()
    } else {
        let opts: Vec<&str> = options.iter().map(|o| o.as_str()).collect();
        format!("{}:{}", path, opts.join(","))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFileWire {
    #[serde(default)]
    defaults: Option<ContainerConfig>,
    #[serde(default)]
    containers: Option<BTreeMap<String, ContainerConfig>>,
}

/// One parsed config file: a `defaults` layer plus named containers, all
/// tagged with the file they came from.
#[derive(Clone, Debug)]
pub struct ConfigFile {
    pub path: HostPath,
    pub defaults: ContainerConfig,
    pub containers: BTreeMap<String, ContainerConfig>,
}

pub fn load_config_file(path: &HostPath) -> Result<ConfigFile> {
    let text = std::fs::read_to_string(path.as_path())
        .with_context(|| format!("failed to read config file {path}"))?;
    let wire: ConfigFileWire =
        toml::from_str(&text).with_context(|| format!("failed to parse config file {path}"))?;

    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("config file {path} has no parent directory"))?;

    let mut defaults = wire.defaults.unwrap_or_default();
    defaults.config_file_path = Some(path.clone());
    resolve_layer_paths(&mut defaults, &dir, PathOrigin::File)
        .with_context(|| format!("in the defaults section of {path}"))?;

    let mut containers = BTreeMap::new();
    for (name, mut config) in wire.containers.unwrap_or_default() {
        config.config_file_path = Some(path.clone());
        resolve_layer_paths(&mut config, &dir, PathOrigin::File)
            .with_context(|| format!("in container {name:?} of {path}"))?;
        containers.insert(name, config);
    }

    Ok(ConfigFile {
        path: path.clone(),
        defaults,
        containers,
    })
}

/// The user-scope config file, `~/.ctenv.toml`.
pub fn user_config_path(home: &HostPath) -> HostPath {
    home.join(CONFIG_FILE_NAME)
}

/// Finds the project-scope config file by walking upward from `cwd`. The
/// walk stops at the user's home directory without entering it, and never
/// crosses a filesystem mount boundary.
pub fn find_project_config(cwd: &HostPath, home: &HostPath) -> Option<HostPath> {
    let start_dev = match std::fs::metadata(cwd.as_path()) {
        Ok(meta) => meta.dev(),
        Err(err) => {
            tracing::debug!("not walking for {CONFIG_FILE_NAME}: cannot stat {cwd}: {err}");
            return None;
        }
    };

    let mut dir = cwd.clone();
    loop {
        if dir == *home {
            return None;
        }
        match std::fs::metadata(dir.as_path()) {
            Ok(meta) if meta.dev() == start_dev => {}
            _ => return None,
        }
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.as_path().is_file() {
            return Some(candidate);
        }
        match dir.parent() {
            Some(parent) if parent != dir => dir = parent,
            _ => return None,
        }
    }
}

/// The ordered set of config files for one invocation, lowest precedence
/// first.
#[derive(Clone, Debug, Default)]
pub struct ConfigStack {
    pub files: Vec<ConfigFile>,
}

impl ConfigStack {
    /// Loads the discovered user- and project-scope files, or, when
    /// explicit paths are given, exactly those files in order.
    pub fn load(
        explicit: &[HostPath],
        home: &HostPath,
        cwd: &HostPath,
    ) -> Result<(Self, Option<HostPath>)> {
        let mut files = Vec::new();
        let mut project_file = None;

        if explicit.is_empty() {
            let user_path = user_config_path(home);
            if user_path.as_path().is_file() {
                files.push(load_config_file(&user_path)?);
            }
            if let Some(path) = find_project_config(cwd, home) {
                project_file = Some(path.clone());
                files.push(load_config_file(&path)?);
            }
        } else {
            for path in explicit {
                files.push(load_config_file(path)?);
            }
        }

        Ok((Self { files }, project_file))
    }

    /// All named containers after shadowing: a container defined in a
    /// higher-precedence file fully replaces a same-named one below it.
    pub fn effective_containers(&self) -> BTreeMap<&str, &ContainerConfig> {
        let mut map = BTreeMap::new();
        for file in &self.files {
            for (name, config) in &file.containers {
                map.insert(name.as_str(), config);
            }
        }
        map
    }

    /// The container picked by a `default = true` marker when no name is
    /// given on the command line.
    pub fn default_container(&self) -> Result<Option<String>> {
        let defaults: Vec<&str> = self
            .effective_containers()
            .into_iter()
            .filter(|(_, config)| config.default.value().copied().unwrap_or(false))
            .map(|(name, _)| name)
            .collect();
        match defaults.as_slice() {
            [] => Ok(None),
            [name] => Ok(Some((*name).to_owned())),
            many => bail!(
                "multiple containers are marked default = true: {}",
                many.join(", ")
            ),
        }
    }

    /// Merges built-in defaults, every file's `defaults` section, the
    /// selected container (if any), and the CLI layer, in that order.
    pub fn effective(&self, container: Option<&str>, cli: &ContainerConfig) -> Result<ContainerConfig> {
        let mut merged = builtin_defaults();
        for file in &self.files {
            merged = file.defaults.over(&merged);
        }

        let selected = match container {
            Some(name) => {
                let containers = self.effective_containers();
                let config = containers.get(name).copied().ok_or_else(|| {
                    let known: Vec<&str> = containers.keys().copied().collect();
                    if known.is_empty() {
                        anyhow!("unknown container {name:?}: no config file defines any containers")
                    } else {
                        anyhow!(
                            "unknown container {name:?}: known containers are {}",
                            known.join(", ")
                        )
                    }
                })?;
                Some(config)
            }
            None => None,
        };
        if let Some(config) = selected {
            merged = config.over(&merged);
        }

        Ok(cli.over(&merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn parse_layer(toml_text: &str) -> ContainerConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn absent_field_is_unset() {
        let config = parse_layer("image = \"debian:12\"");
        assert_eq!(config.image, Setting::Set(String::from("debian:12")));
        assert_eq!(config.command, Setting::Unset);
        assert_eq!(config.volumes, Setting::Unset);
    }

    #[test]
    fn notset_literal_parses_to_cleared() {
        let config = parse_layer(indoc! {r#"
            image = "NOTSET"
            sudo = "NOTSET"
            volumes = "NOTSET"
        "#});
        assert_eq!(config.image, Setting::Cleared);
        assert_eq!(config.sudo, Setting::Cleared);
        assert_eq!(config.volumes, Setting::Cleared);
    }

    #[test]
    fn unset_layer_preserves_lower_value() {
        let lower = parse_layer("image = \"debian:12\"\nsudo = true");
        let upper = parse_layer("network = \"none\"");
        let merged = upper.over(&lower);
        assert_eq!(merged.image, Setting::Set(String::from("debian:12")));
        assert_eq!(merged.sudo, Setting::Set(true));
        assert_eq!(merged.network, Setting::Set(String::from("none")));
    }

    #[test]
    fn set_and_cleared_both_override() {
        let lower = parse_layer("image = \"debian:12\"\nnetwork = \"bridge\"");
        let upper = parse_layer("image = \"alpine:latest\"\nnetwork = \"NOTSET\"");
        let merged = upper.over(&lower);
        assert_eq!(merged.image, Setting::Set(String::from("alpine:latest")));
        assert_eq!(merged.network, Setting::Cleared);
    }

    #[test]
    fn empty_list_overrides() {
        let lower = parse_layer("volumes = [\"/a:/b\"]");
        let upper = parse_layer("volumes = []");
        let merged = upper.over(&lower);
        assert_eq!(merged.volumes, Setting::Set(vec![]));
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let err = toml::from_str::<ConfigFileWire>("[container]\n").unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn unknown_container_key_is_rejected() {
        let err = toml::from_str::<ConfigFileWire>(indoc! {r#"
            [containers.dev]
            imaeg = "debian:12"
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn wrong_type_is_rejected() {
        let err = toml::from_str::<ContainerConfig>("volumes = \"/a:/b\"").unwrap_err();
        assert!(err.to_string().contains("volumes"), "{err}");
    }

    #[test]
    fn tty_accepts_bool_and_auto() {
        assert_eq!(parse_layer("tty = true").tty, Setting::Set(TtyMode::On));
        assert_eq!(parse_layer("tty = false").tty, Setting::Set(TtyMode::Off));
        assert_eq!(parse_layer("tty = \"auto\"").tty, Setting::Set(TtyMode::Auto));
        assert_eq!(parse_layer("tty = \"NOTSET\"").tty, Setting::Cleared);
        assert!(toml::from_str::<ContainerConfig>("tty = \"sometimes\"").is_err());
    }

    #[test]
    fn ulimits_accept_numbers_and_pairs() {
        let config = parse_layer(indoc! {r#"
            [ulimits]
            nofile = 1024
            core = "0:unlimited"
        "#});
        let ulimits = config.ulimits.value().unwrap();
        assert_eq!(ulimits["nofile"], UlimitValue::Limit(1024));
        assert_eq!(
            ulimits["core"],
            UlimitValue::SoftHard(String::from("0:unlimited"))
        );
    }

    #[test]
    fn record_with_tables_renders_as_valid_toml() {
        // ulimits and build become TOML tables; every scalar and array
        // field must land before them or the rendering is rejected (or
        // reparses with the trailing values inside the wrong table).
        let config = parse_layer(indoc! {r#"
            image = "alpine:latest"
            runtime = "podman"
            default = true
            env = ["TERM=xterm"]

            [ulimits]
            nofile = 1024

            [build]
            dockerfile_content = "FROM alpine"
            tag = "t"
        "#});
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed: ContainerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.runtime, Setting::Set(Runtime::Podman));
        assert_eq!(reparsed.default, Setting::Set(true));
        assert_eq!(reparsed.env, Setting::Set(vec![String::from("TERM=xterm")]));
        assert_eq!(
            reparsed.ulimits.value().unwrap()["nofile"],
            UlimitValue::Limit(1024)
        );
        assert_eq!(
            reparsed.build.value().unwrap().tag,
            Setting::Set(String::from("t"))
        );
    }

    fn write_config(dir: &std::path::Path, name: &str, text: &str) -> HostPath {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        HostPath::try_from(path).unwrap()
    }

    #[test]
    fn file_relative_paths_resolve_against_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            CONFIG_FILE_NAME,
            indoc! {r#"
                [defaults]
                project_dir = "./proj"
                gosu_path = "bin/gosu"
                volumes = ["./cache:/cache", "named:/data"]

                [defaults.build]
                dockerfile = "Dockerfile.dev"
                context = "."
            "#},
        );
        let file = load_config_file(&path).unwrap();
        let base = path.parent().unwrap();

        assert_eq!(
            file.defaults.project_dir.value().unwrap(),
            &base.join("proj").display().to_string()
        );
        assert_eq!(
            file.defaults.gosu_path.value().unwrap(),
            &base.join("bin/gosu").display().to_string()
        );
        let volumes = file.defaults.volumes.value().unwrap();
        assert_eq!(volumes[0], format!("{}:/cache", base.join("cache").display()));
        // Named volumes are not paths and pass through untouched.
        assert_eq!(volumes[1], "named:/data");
        let build = file.defaults.build.value().unwrap();
        assert_eq!(
            build.dockerfile.value().unwrap(),
            &base.join("Dockerfile.dev").display().to_string()
        );
        assert_eq!(build.context.value().unwrap(), &base.display().to_string());
    }

    #[test]
    fn build_context_defaults_to_the_layer_origin() {
        let base = HostPath::try_from("/cfg").unwrap();
        let mut config = ContainerConfig {
            build: Setting::Set(BuildConfig {
                dockerfile_content: Setting::Set(String::from("FROM alpine")),
                ..BuildConfig::default()
            }),
            ..ContainerConfig::default()
        };
        resolve_layer_paths(&mut config, &base, PathOrigin::File).unwrap();
        assert_eq!(
            config.build.value().unwrap().context,
            Setting::Set(String::from("/cfg"))
        );
    }

    #[test]
    fn cli_relative_workdir_is_rejected() {
        let cwd = HostPath::try_from("/work").unwrap();
        let mut config = ContainerConfig {
            workdir: Setting::Set(String::from("sub/dir")),
            ..ContainerConfig::default()
        };
        let err = resolve_layer_paths(&mut config, &cwd, PathOrigin::Cli).unwrap_err();
        assert!(err.to_string().contains("--workdir"), "{err}");

        let mut config = ContainerConfig {
            workdir: Setting::Set(String::from("auto")),
            ..ContainerConfig::default()
        };
        resolve_layer_paths(&mut config, &cwd, PathOrigin::Cli).unwrap();
    }

    #[test]
    fn template_hooks_are_left_for_substitution() {
        let base = HostPath::try_from("/cfg").unwrap();
        let mut config = ContainerConfig {
            volumes: Setting::Set(vec![String::from("${user_home}/.cache:/cache")]),
            ..ContainerConfig::default()
        };
        resolve_layer_paths(&mut config, &base, PathOrigin::File).unwrap();
        assert_eq!(
            config.volumes.value().unwrap()[0],
            "${user_home}/.cache:/cache"
        );
    }

    #[test]
    fn malformed_volume_fails_at_load() {
        let base = HostPath::try_from("/cfg").unwrap();
        let mut config = ContainerConfig {
            volumes: Setting::Set(vec![String::from(":/nowhere")]),
            ..ContainerConfig::default()
        };
        let err = resolve_layer_paths(&mut config, &base, PathOrigin::File).unwrap_err();
        assert!(err.to_string().contains("invalid volume spec"), "{err}");
    }

    fn stack_from(files: Vec<ConfigFile>) -> ConfigStack {
        ConfigStack { files }
    }

    fn file_with(path: &str, text: &str) -> ConfigFile {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), path, text);
        load_config_file(&path).unwrap()
    }

    #[test]
    fn project_container_fully_shadows_user_container() {
        let user = file_with(
            "user.toml",
            indoc! {r#"
                [containers.dev]
                image = "debian:12"
                volumes = ["/user/cache:/cache"]
                env = ["FROM_USER=1"]
            "#},
        );
        let project = file_with(
            "project.toml",
            indoc! {r#"
                [containers.dev]
                image = "alpine:latest"
            "#},
        );
        let stack = stack_from(vec![user, project]);
        let merged = stack.effective(Some("dev"), &ContainerConfig::default()).unwrap();

        assert_eq!(merged.image, Setting::Set(String::from("alpine:latest")));
        // The user-scope record for `dev` is replaced, not merged into.
        assert_eq!(merged.volumes, Setting::Unset);
        assert_eq!(merged.env, Setting::Unset);
    }

    #[test]
    fn defaults_sections_layer_across_files() {
        let user = file_with(
            "user.toml",
            indoc! {r#"
                [defaults]
                network = "bridge"
                sudo = true
            "#},
        );
        let project = file_with(
            "project.toml",
            indoc! {r#"
                [defaults]
                network = "none"
            "#},
        );
        let stack = stack_from(vec![user, project]);
        let merged = stack.effective(None, &ContainerConfig::default()).unwrap();
        assert_eq!(merged.network, Setting::Set(String::from("none")));
        assert_eq!(merged.sudo, Setting::Set(true));
    }

    #[test]
    fn single_default_marker_selects_the_container() {
        let file = file_with(
            "ctenv.toml",
            indoc! {r#"
                [containers.dev]
                image = "debian:12"
                default = true

                [containers.ci]
                image = "alpine:latest"
            "#},
        );
        let stack = stack_from(vec![file]);
        assert_eq!(stack.default_container().unwrap(), Some(String::from("dev")));
    }

    #[test]
    fn two_default_markers_are_ambiguous() {
        let file = file_with(
            "ctenv.toml",
            indoc! {r#"
                [containers.dev]
                default = true

                [containers.ci]
                default = true
            "#},
        );
        let stack = stack_from(vec![file]);
        let err = stack.default_container().unwrap_err();
        assert!(err.to_string().contains("multiple containers"), "{err}");
    }

    #[test]
    fn shadowing_applies_to_default_markers_too() {
        let user = file_with(
            "user.toml",
            indoc! {r#"
                [containers.dev]
                default = true
            "#},
        );
        let project = file_with(
            "project.toml",
            indoc! {r#"
                [containers.dev]
                image = "alpine:latest"
            "#},
        );
        let stack = stack_from(vec![user, project]);
        // The project-scope `dev` record does not carry the marker, and it
        // replaces the user-scope record wholesale.
        assert_eq!(stack.default_container().unwrap(), None);
    }

    #[test]
    fn unknown_container_name_is_an_error() {
        let file = file_with(
            "ctenv.toml",
            indoc! {r#"
                [containers.dev]
                image = "debian:12"
            "#},
        );
        let stack = stack_from(vec![file]);
        let err = stack
            .effective(Some("prod"), &ContainerConfig::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unknown container \"prod\""), "{message}");
        assert!(message.contains("dev"), "{message}");
    }

    #[test]
    fn cli_layer_has_the_last_word() {
        let file = file_with(
            "ctenv.toml",
            indoc! {r#"
                [defaults]
                image = "debian:12"
                network = "bridge"
            "#},
        );
        let stack = stack_from(vec![file]);
        let cli = ContainerConfig {
            image: Setting::Set(String::from("alpine:latest")),
            network: Setting::Cleared,
            ..ContainerConfig::default()
        };
        let merged = stack.effective(None, &cli).unwrap();
        assert_eq!(merged.image, Setting::Set(String::from("alpine:latest")));
        assert_eq!(merged.network, Setting::Cleared);
    }

    #[test]
    fn discovery_walks_up_and_stops_at_home() {
        let tree = tempfile::tempdir().unwrap();
        let home = tree.path().join("home/alice");
        let project = home.join("src/proj");
        let nested = project.join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(project.join(CONFIG_FILE_NAME), "").unwrap();
        std::fs::write(home.join(CONFIG_FILE_NAME), "").unwrap();

        let home = HostPath::try_from(home).unwrap();
        let nested = HostPath::try_from(nested).unwrap();
        let found = find_project_config(&nested, &home).unwrap();
        assert_eq!(found, project.join(CONFIG_FILE_NAME).try_into().unwrap());

        // From a directory with no project file between it and home, the
        // walk stops before home: the user-scope file is not a project file.
        let plain = home.join("plain");
        std::fs::create_dir_all(&plain).unwrap();
        let plain = HostPath::try_from(plain).unwrap();
        assert_eq!(find_project_config(&plain, &home), None);
    }

    #[test]
    fn builtin_defaults_cover_the_resolver_inputs() {
        let defaults = builtin_defaults();
        assert_eq!(defaults.auto_project_mount, Setting::Set(true));
        assert_eq!(defaults.workdir, Setting::Set(String::from("auto")));
        assert_eq!(defaults.runtime, Setting::Set(Runtime::Docker));
        assert!(defaults
            .container_name
            .value()
            .unwrap()
            .contains("${pid}"));
    }
}
