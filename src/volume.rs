//! The `HOST[:CONTAINER[:OPTS]]` volume grammar.
//!
//! `HOST` may be a path or a named volume; an empty `CONTAINER` asks the
//! spec resolver to pick a target (identity for paths outside the project,
//! project-relative remapping for paths inside it). The `chown` option is
//! consumed by the entrypoint generator and never reaches the runtime.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeOpt {
    ReadOnly,
    ReadWrite,
    RelabelShared,
    RelabelPrivate,
    Chown,
}

impl VolumeOpt {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ro" => Some(Self::ReadOnly),
            "rw" => Some(Self::ReadWrite),
            "z" => Some(Self::RelabelShared),
            "Z" => Some(Self::RelabelPrivate),
            "chown" => Some(Self::Chown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
            Self::RelabelShared => "z",
            Self::RelabelPrivate => "Z",
            Self::Chown => "chown",
        }
    }
}

impl fmt::Display for VolumeOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum VolumeError {
    #[error("volume spec {0:?} has an empty host component")]
    EmptyHost(String),

    #[error("unknown option {option:?} in volume spec {spec:?}")]
    UnknownOption { spec: String, option: String },
}

/// One parsed volume, as written in a config file or on the command line.
/// Host paths may still be relative or contain template variables at this
/// stage; the spec resolver produces the final absolute form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    pub host: String,
    pub container: Option<String>,
    pub options: Vec<VolumeOpt>,
}

impl FromStr for VolumeSpec {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, VolumeError> {
        let mut parts = s.splitn(3, ':');
        let host = parts.next().unwrap_or_default();
        if host.is_empty() {
            return Err(VolumeError::EmptyHost(s.to_owned()));
        }
        let container = parts.next().filter(|c| !c.is_empty()).map(str::to_owned);
        let options = match parts.next() {
            Some(opts) => parse_options(s, opts)?,
            None => Vec::new(),
        };
        Ok(Self {
            host: host.to_owned(),
            container,
            options,
        })
    }
}

impl fmt::Display for VolumeSpec {
    /// Renders the canonical `HOST[:CONTAINER[:OPTS]]` form, including
    /// tool-consumed options. An option list with no container keeps its
    /// empty slot (`host::chown`) so the string reparses to itself.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)?;
        match (&self.container, self.options.is_empty()) {
            (None, true) => Ok(()),
            (Some(container), true) => write!(f, ":{container}"),
            (container, false) => {
                let opts: Vec<&str> = self.options.iter().map(|o| o.as_str()).collect();
                write!(
                    f,
                    ":{}:{}",
                    container.as_deref().unwrap_or_default(),
                    opts.join(",")
                )
            }
        }
    }
}

impl VolumeSpec {
    pub fn has(&self, opt: VolumeOpt) -> bool {
        self.options.contains(&opt)
    }

    /// Whether the host component names a filesystem path, as opposed to a
    /// named volume managed by the runtime.
    pub fn host_is_path(&self) -> bool {
        self.host.starts_with('/') || self.host.starts_with('.') || self.host.contains('/')
    }
}

fn parse_options(spec: &str, opts: &str) -> Result<Vec<VolumeOpt>, VolumeError> {
    let mut parsed = Vec::new();
    for item in opts.split(',').filter(|o| !o.is_empty()) {
        let opt = VolumeOpt::parse(item).ok_or_else(|| VolumeError::UnknownOption {
            spec: spec.to_owned(),
            option: item.to_owned(),
        })?;
        if !parsed.contains(&opt) {
            parsed.push(opt);
        }
    }
    Ok(parsed)
}

/// Parses a project-target value, `TARGET[:OPTS]`. The options apply to the
/// project mount itself.
pub fn parse_target_spec(s: &str) -> Result<(String, Vec<VolumeOpt>), VolumeError> {
    let mut parts = s.splitn(2, ':');
    let target = parts.next().unwrap_or_default();
    if target.is_empty() {
        return Err(VolumeError::EmptyHost(s.to_owned()));
    }
    let options = match parts.next() {
        Some(opts) => parse_options(s, opts)?,
        None => Vec::new(),
    };
    Ok((target.to_owned(), options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(s: &str) -> VolumeSpec {
        s.parse().unwrap()
    }

    #[test]
    fn host_only() {
        assert_eq!(
            parse("/p/src"),
            VolumeSpec {
                host: "/p/src".to_owned(),
                container: None,
                options: vec![],
            }
        );
    }

    #[test]
    fn empty_container_component() {
        assert_eq!(parse("/p/src:").container, None);
        assert_eq!(
            parse("/p/src::chown"),
            VolumeSpec {
                host: "/p/src".to_owned(),
                container: None,
                options: vec![VolumeOpt::Chown],
            }
        );
    }

    #[test]
    fn full_triple() {
        assert_eq!(
            parse("cache:/var/cache:ro,Z,chown"),
            VolumeSpec {
                host: "cache".to_owned(),
                container: Some("/var/cache".to_owned()),
                options: vec![
                    VolumeOpt::ReadOnly,
                    VolumeOpt::RelabelPrivate,
                    VolumeOpt::Chown
                ],
            }
        );
    }

    #[test]
    fn duplicate_options_collapse() {
        assert_eq!(
            parse("/a:/b:ro,ro").options,
            vec![VolumeOpt::ReadOnly]
        );
    }

    #[test]
    fn empty_host_is_an_error() {
        assert_eq!(
            ":/container".parse::<VolumeSpec>(),
            Err(VolumeError::EmptyHost(":/container".to_owned()))
        );
        assert!("".parse::<VolumeSpec>().is_err());
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert_eq!(
            "/a:/b:rx".parse::<VolumeSpec>(),
            Err(VolumeError::UnknownOption {
                spec: "/a:/b:rx".to_owned(),
                option: "rx".to_owned(),
            })
        );
    }

    #[test]
    fn named_volume_vs_path_host() {
        assert!(!parse("cache:/var/cache").host_is_path());
        assert!(parse("/p/src").host_is_path());
        assert!(parse("./rel").host_is_path());
        assert!(parse("sub/dir").host_is_path());
    }

    #[test]
    fn display_reparses_to_itself() {
        for spec in ["/p/src", "/p/src:/repo/src", "cache:/var/cache:ro,chown", "/a::chown"] {
            let parsed = parse(spec);
            assert_eq!(parsed.to_string(), spec);
            assert_eq!(parse(&parsed.to_string()), parsed);
        }
    }

    #[test]
    fn target_spec_with_options() {
        assert_eq!(
            parse_target_spec("/repo:ro,z").unwrap(),
            (
                "/repo".to_owned(),
                vec![VolumeOpt::ReadOnly, VolumeOpt::RelabelShared]
            )
        );
        assert_eq!(parse_target_spec("/repo").unwrap(), ("/repo".to_owned(), vec![]));
        assert!(parse_target_spec(":ro").is_err());
    }
}
