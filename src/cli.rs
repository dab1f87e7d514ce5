//! The command-line surface and its translation into a configuration
//! layer. Everything the flags say becomes one [`ContainerConfig`] that
//! merges on top of the file layers; the CLI has the highest precedence.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

use crate::config::{self, BuildConfig, ContainerConfig, Setting, TtyMode, UlimitValue};
use crate::newtype::HostPath;
use crate::runtime::Runtime;
use crate::Ctenv;

pub fn parse() -> Cli {
    Cli::parse()
}

#[derive(Debug, Parser)]
#[command(
    name = "ctenv",
    version,
    about = "Run commands in containers as yourself",
    long_about = "Runs a command inside a container while mirroring your host \
                  identity into it, so files created inside come out owned by \
                  you and absolute project paths stay valid."
)]
pub struct Cli {
    /// More diagnostic output (repeat for trace output)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all non-essential output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Use these config files instead of the discovered ones
    /// (lowest precedence first; may be repeated)
    #[arg(long, value_name = "FILE")]
    pub config: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a command in a container
    Run(RunArgs),
    /// Build a container image without running it
    Build(BuildArgs),
    /// Inspect the effective configuration
    Config(ConfigArgs),
    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

/// Flags shared by `run` and `build`. Each one overrides the same-named
/// config field; the literal value `NOTSET` clears a field explicitly.
#[derive(Args, Debug, Default)]
pub struct ContainerArgs {
    /// Container runtime to invoke
    #[arg(long, value_enum)]
    pub runtime: Option<Runtime>,

    /// Image reference to run (mutually exclusive with the build flags)
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Project directory (default: detected from the nearest .ctenv.toml)
    #[arg(long, value_name = "PATH")]
    pub project_dir: Option<PathBuf>,

    /// In-container mount point for the project directory,
    /// optionally with mount options (e.g. /repo:ro)
    #[arg(long, value_name = "SPEC")]
    pub project_target: Option<String>,

    /// Do not mount the project directory automatically
    #[arg(long)]
    pub no_auto_project_mount: bool,

    /// Mount only this project subpath (repeatable; needs
    /// --no-auto-project-mount to take effect)
    #[arg(long = "subpath", value_name = "SPEC")]
    pub subpaths: Vec<String>,

    /// Working directory inside the container ("auto" preserves the
    /// host-relative one)
    #[arg(long, value_name = "PATH")]
    pub workdir: Option<String>,

    /// Path to the privilege-drop helper ("auto" uses the bundled binary)
    #[arg(long, value_name = "PATH")]
    pub gosu_path: Option<String>,

    /// Container name (supports ${...} template variables)
    #[arg(long = "name", value_name = "NAME")]
    pub container_name: Option<String>,

    /// Allocate a terminal
    #[arg(long, value_name = "WHEN", value_parser = ["auto", "yes", "no", config::NOTSET])]
    pub tty: Option<String>,

    /// Install sudo and allow it without a password
    #[arg(long)]
    pub sudo: bool,

    /// Container network (e.g. none, bridge, or a named network)
    #[arg(long, value_name = "NAME")]
    pub network: Option<String>,

    /// Target platform (e.g. linux/amd64)
    #[arg(long, value_name = "STR")]
    pub platform: Option<String>,

    /// Resource limit (repeatable)
    #[arg(long = "ulimit", value_name = "NAME=VALUE", value_parser = parse_ulimit)]
    pub ulimits: Vec<(String, UlimitValue)>,

    /// Environment variable to set (NAME=VALUE) or pass through (NAME);
    /// repeatable
    #[arg(short = 'e', long = "env", value_name = "NAME[=VALUE]", value_parser = parse_env_entry)]
    pub env: Vec<String>,

    /// Volume to mount, HOST[:CONTAINER[:OPTS]]; repeatable
    #[arg(short = 'v', long = "volume", value_name = "SPEC")]
    pub volumes: Vec<String>,

    /// Command run as root after setup, before the privilege drop;
    /// repeatable
    #[arg(long = "post-start-command", value_name = "CMD")]
    pub post_start_commands: Vec<String>,

    /// Extra argument passed to the runtime verbatim; repeatable
    #[arg(long = "run-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub run_args: Vec<String>,

    /// Build from this dockerfile instead of using an image
    #[arg(long, value_name = "PATH", conflicts_with = "build_dockerfile_content")]
    pub build_dockerfile: Option<String>,

    /// Build from inline dockerfile content
    #[arg(long, value_name = "STR")]
    pub build_dockerfile_content: Option<String>,

    /// Build context directory ("-" for an empty context)
    #[arg(long, value_name = "PATH")]
    pub build_context: Option<String>,

    /// Tag for the built image (default: derived from the project path)
    #[arg(long, value_name = "TAG")]
    pub build_tag: Option<String>,

    /// Build argument (repeatable)
    #[arg(long = "build-arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub build_args: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub container: ContainerArgs,

    /// Print the runtime invocation instead of executing it
    #[arg(long)]
    pub dry_run: bool,

    /// Named container from the config files (default: the one marked
    /// default = true, if any)
    #[arg(value_name = "CONTAINER_NAME")]
    pub name: Option<String>,

    /// Command to run inside the container, after "--"
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub container: ContainerArgs,

    /// Print the build invocation instead of executing it
    #[arg(long)]
    pub dry_run: bool,

    /// Named container from the config files
    #[arg(value_name = "CONTAINER_NAME")]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: Option<ConfigCommand>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective resolved configuration
    Show {
        #[arg(value_name = "CONTAINER_NAME")]
        container: Option<String>,

        /// Machine-readable JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

fn parse_ulimit(s: &str) -> Result<(String, UlimitValue), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    if name.is_empty() {
        return Err(format!("expected NAME=VALUE, got {s:?}"));
    }
    let value = match value.parse::<i64>() {
        Ok(limit) => UlimitValue::Limit(limit),
        Err(_) => UlimitValue::SoftHard(value.to_owned()),
    };
    Ok((name.to_owned(), value))
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn parse_env_entry(s: &str) -> Result<String, String> {
    let name = s.split_once('=').map_or(s, |(name, _)| name);
    if name.is_empty() {
        return Err(format!("expected NAME or NAME=VALUE, got {s:?}"));
    }
    Ok(s.to_owned())
}

fn setting_from_flag(value: &Option<String>) -> Setting<String> {
    match value.as_deref() {
        None => Setting::Unset,
        Some(config::NOTSET) => Setting::Cleared,
        Some(value) => Setting::Set(value.to_owned()),
    }
}

fn setting_from_list(values: &[String]) -> Setting<Vec<String>> {
    match values {
        [] => Setting::Unset,
        [only] if only == config::NOTSET => Setting::Cleared,
        _ => Setting::Set(values.to_vec()),
    }
}

impl ContainerArgs {
    /// Builds the CLI configuration layer. Relative paths in the flags
    /// resolve against `cwd`, and a relative `--workdir` is rejected.
    pub fn to_layer(&self, cwd: &HostPath) -> Result<ContainerConfig> {
        let mut layer = ContainerConfig {
            image: setting_from_flag(&self.image),
            project_dir: setting_from_flag(&self.project_dir.as_ref().map(|p| p.display().to_string())),
            project_target: setting_from_flag(&self.project_target),
            subpaths: setting_from_list(&self.subpaths),
            workdir: setting_from_flag(&self.workdir),
            gosu_path: setting_from_flag(&self.gosu_path),
            container_name: setting_from_flag(&self.container_name),
            network: setting_from_flag(&self.network),
            platform: setting_from_flag(&self.platform),
            env: setting_from_list(&self.env),
            volumes: setting_from_list(&self.volumes),
            post_start_commands: setting_from_list(&self.post_start_commands),
            run_args: setting_from_list(&self.run_args),
            ..ContainerConfig::default()
        };

        if self.no_auto_project_mount {
            layer.auto_project_mount = Setting::Set(false);
        }
        if self.sudo {
            layer.sudo = Setting::Set(true);
        }
        if let Some(runtime) = self.runtime {
            layer.runtime = Setting::Set(runtime);
        }
        layer.tty = match self.tty.as_deref() {
            None => Setting::Unset,
            Some(config::NOTSET) => Setting::Cleared,
            Some("yes") => Setting::Set(TtyMode::On),
            Some("no") => Setting::Set(TtyMode::Off),
            // The value parser admits nothing else.
            Some(_) => Setting::Set(TtyMode::Auto),
        };
        if !self.ulimits.is_empty() {
            let map: BTreeMap<String, UlimitValue> = self.ulimits.iter().cloned().collect();
            layer.ulimits = Setting::Set(map);
        }

        let build_flags_used = self.build_dockerfile.is_some()
            || self.build_dockerfile_content.is_some()
            || self.build_context.is_some()
            || self.build_tag.is_some()
            || !self.build_args.is_empty();
        if build_flags_used {
            layer.build = Setting::Set(BuildConfig {
                dockerfile: setting_from_flag(&self.build_dockerfile),
                dockerfile_content: setting_from_flag(&self.build_dockerfile_content),
                context: setting_from_flag(&self.build_context),
                tag: setting_from_flag(&self.build_tag),
                args: if self.build_args.is_empty() {
                    Setting::Unset
                } else {
                    Setting::Set(self.build_args.iter().cloned().collect())
                },
            });
        }

        config::resolve_layer_paths(&mut layer, cwd, config::PathOrigin::Cli)?;
        Ok(layer)
    }
}

impl RunArgs {
    fn to_layer(&self, cwd: &HostPath) -> Result<ContainerConfig> {
        let mut layer = self.container.to_layer(cwd)?;
        if !self.command.is_empty() {
            let command = shlex::join(self.command.iter().map(String::as_str));
            layer.command = Setting::Set(command);
        }
        Ok(layer)
    }
}

pub fn init_logging(verbose: u8, quiet: bool) {
    let directive = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "ctenv=debug",
            _ => "ctenv=trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Dispatches a parsed invocation and returns the exit code.
pub fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => {
            let program = Ctenv::new(&cli.config, args.container.project_dir.clone())?;
            let layer = args.to_layer(program.cwd())?;
            program.run(args.name.as_deref(), &layer, args.dry_run)
        }
        Command::Build(args) => {
            let program = Ctenv::new(&cli.config, args.container.project_dir.clone())?;
            let layer = args.container.to_layer(program.cwd())?;
            program.build(args.name.as_deref(), &layer, args.dry_run)?;
            Ok(0)
        }
        Command::Config(args) => {
            // Bare `ctenv config` behaves as `config show`.
            let (container, json) = match args.command {
                Some(ConfigCommand::Show { container, json }) => (container, json),
                None => (None, false),
            };
            let program = Ctenv::new(&cli.config, None)?;
            program.show_config(container.as_deref(), &ContainerConfig::default(), json)?;
            Ok(0)
        }
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "ctenv", &mut std::io::stdout());
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    fn parse_cli(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn run_takes_a_container_name_and_a_command_tail() {
        let cli = parse_cli(&[
            "ctenv", "run", "--image", "alpine:latest", "dev", "--", "id", "-u",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.name.as_deref(), Some("dev"));
        assert_eq!(args.command, vec!["id", "-u"]);
        assert_eq!(args.container.image.as_deref(), Some("alpine:latest"));
    }

    #[test]
    fn command_tail_becomes_one_shell_command() {
        let cli = parse_cli(&["ctenv", "run", "--", "echo", "hello world", "it's"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        let layer = args.to_layer(&cwd).unwrap();
        // The tail becomes one string handed to /bin/sh -c inside the
        // container; splitting it again recovers the original words.
        let Setting::Set(command) = layer.command else {
            panic!("expected a command");
        };
        assert_eq!(
            shlex::split(&command).unwrap(),
            vec!["echo", "hello world", "it's"]
        );
    }

    #[test]
    fn verbose_and_quiet_parse_before_the_subcommand() {
        let cli = parse_cli(&["ctenv", "-vv", "run"]);
        assert_eq!(cli.verbose, 2);
        let cli = parse_cli(&["ctenv", "--quiet", "config"]);
        assert!(cli.quiet);
        assert!(Cli::try_parse_from(["ctenv", "-v", "-q", "run"]).is_err());
    }

    #[test]
    fn relative_cli_volume_resolves_against_the_cwd() {
        let cli = parse_cli(&["ctenv", "run", "-v", "./x:/y"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        let layer = args.to_layer(&cwd).unwrap();
        assert_eq!(
            layer.volumes,
            Setting::Set(vec![String::from("/work/x:/y")])
        );
    }

    #[test]
    fn relative_cli_workdir_is_rejected() {
        let cli = parse_cli(&["ctenv", "run", "--workdir", "sub"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        assert!(args.to_layer(&cwd).is_err());
    }

    #[test]
    fn notset_clears_fields_from_the_cli() {
        let cli = parse_cli(&[
            "ctenv", "run", "--network", "NOTSET", "-v", "NOTSET", "--tty", "NOTSET",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        let layer = args.to_layer(&cwd).unwrap();
        assert_eq!(layer.network, Setting::Cleared);
        assert_eq!(layer.volumes, Setting::Cleared);
        assert_eq!(layer.tty, Setting::Cleared);
    }

    #[test]
    fn flags_toggle_bools_without_clearing_them() {
        let cli = parse_cli(&["ctenv", "run", "--sudo", "--no-auto-project-mount"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        let layer = args.to_layer(&cwd).unwrap();
        assert_eq!(layer.sudo, Setting::Set(true));
        assert_eq!(layer.auto_project_mount, Setting::Set(false));

        let layer = parse_cli(&["ctenv", "run"]);
        let Command::Run(args) = layer.command else {
            panic!("expected run");
        };
        let layer = args.to_layer(&cwd).unwrap();
        assert_eq!(layer.sudo, Setting::Unset);
        assert_eq!(layer.auto_project_mount, Setting::Unset);
    }

    #[test]
    fn ulimits_parse_numbers_and_pairs() {
        let cli = parse_cli(&[
            "ctenv", "run", "--ulimit", "nofile=1024", "--ulimit", "core=0:unlimited",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        let layer = args.to_layer(&cwd).unwrap();
        let ulimits = layer.ulimits.value().unwrap();
        assert_eq!(ulimits["nofile"], UlimitValue::Limit(1024));
        assert_eq!(
            ulimits["core"],
            UlimitValue::SoftHard(String::from("0:unlimited"))
        );

        assert!(Cli::try_parse_from(["ctenv", "run", "--ulimit", "nofile"]).is_err());
    }

    #[test]
    fn bad_flag_values_fail_at_parse_time() {
        assert!(Cli::try_parse_from(["ctenv", "run", "--tty", "sometimes"]).is_err());
        assert!(Cli::try_parse_from(["ctenv", "run", "--build-arg", "=x"]).is_err());
        assert!(Cli::try_parse_from(["ctenv", "run", "-e", "=x"]).is_err());
        assert!(Cli::try_parse_from(["ctenv", "run", "--runtime", "lxc"]).is_err());
    }

    #[test]
    fn build_flags_form_a_build_section() {
        let cli = parse_cli(&[
            "ctenv",
            "run",
            "--build-dockerfile-content",
            "FROM alpine",
            "--build-context",
            "-",
            "--build-arg",
            "REV=abc",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        let layer = args.to_layer(&cwd).unwrap();
        let build = layer.build.value().unwrap();
        assert_eq!(
            build.dockerfile_content,
            Setting::Set(String::from("FROM alpine"))
        );
        assert_eq!(build.context, Setting::Set(String::from("-")));
        assert_eq!(build.args.value().unwrap()["REV"], "abc");

        assert!(Cli::try_parse_from([
            "ctenv",
            "run",
            "--build-dockerfile",
            "Dockerfile",
            "--build-dockerfile-content",
            "FROM alpine",
        ])
        .is_err());
    }

    #[test]
    fn dockerfile_path_resolves_against_the_cwd() {
        let cli = parse_cli(&["ctenv", "build", "--build-dockerfile", "Dockerfile.dev"]);
        let Command::Build(args) = cli.command else {
            panic!("expected build");
        };
        let cwd = HostPath::try_from("/work").unwrap();
        let layer = args.container.to_layer(&cwd).unwrap();
        let build = layer.build.value().unwrap();
        assert_eq!(
            build.dockerfile,
            Setting::Set(String::from("/work/Dockerfile.dev"))
        );
    }
}
