//! Newtypes that keep host-side and container-side paths from mixing.
//!
//! Every path in a resolved [`crate::spec::ContainerSpec`] is absolute. The
//! types here enforce that at construction time so the later stages (script
//! generation, argument assembly) never have to re-check.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::anyhow;

/// Generates a newtype wrapper around `String` for names that end up on a
/// runtime command line.
macro_rules! name {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
        pub struct $name(String);

        #[allow(unused)]
        impl $name {
            pub fn new<S: Into<String>>(s: S) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl ::std::convert::AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl ::std::convert::AsRef<::std::ffi::OsStr> for $name {
            fn as_ref(&self) -> &::std::ffi::OsStr {
                self.0.as_ref()
            }
        }
    };
}

pub(crate) use name;

/// Removes `.` components and resolves `..` lexically. The result never
/// touches the filesystem, so symlinks are not chased.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            _ => out.push(component.as_os_str()),
        }
    }
    out
}

macro_rules! abs_path {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
        pub struct $name(PathBuf);

        #[allow(unused)]
        impl $name {
            pub fn as_path(&self) -> &Path {
                &self.0
            }

            /// Joins a path onto this one. An absolute `tail` replaces the
            /// whole path, matching [`PathBuf::join`].
            pub fn join<P: AsRef<Path>>(&self, tail: P) -> Self {
                Self(clean(&self.0.join(tail)))
            }

            pub fn parent(&self) -> Option<Self> {
                self.0.parent().map(|p| Self(p.to_owned()))
            }

            pub fn starts_with(&self, base: &Self) -> bool {
                self.0.starts_with(&base.0)
            }

            /// The path relative to `base`, when this path is `base` or a
            /// descendant of it.
            pub fn relative_to(&self, base: &Self) -> Option<&Path> {
                self.0.strip_prefix(&base.0).ok()
            }

            pub fn display(&self) -> ::std::path::Display<'_> {
                self.0.display()
            }

            /// The path as UTF-8, which the runtime command line requires.
            pub fn to_str(&self) -> anyhow::Result<&str> {
                self.0
                    .to_str()
                    .ok_or_else(|| anyhow!("path not valid UTF-8: {:?}", self.0))
            }
        }

        impl TryFrom<PathBuf> for $name {
            type Error = anyhow::Error;

            fn try_from(path: PathBuf) -> anyhow::Result<Self> {
                if path.is_absolute() {
                    Ok(Self(clean(&path)))
                } else {
                    Err(anyhow!(
                        "expected an absolute path, got {:?}",
                        path.display()
                    ))
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(path: String) -> anyhow::Result<Self> {
                Self::try_from(PathBuf::from(path))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = anyhow::Error;

            fn try_from(path: &str) -> anyhow::Result<Self> {
                Self::try_from(PathBuf::from(path))
            }
        }

        impl ::std::convert::AsRef<Path> for $name {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }

        impl ::std::convert::AsRef<::std::ffi::OsStr> for $name {
            fn as_ref(&self) -> &::std::ffi::OsStr {
                self.0.as_ref()
            }
        }
    };
}

abs_path!(HostPath, "An absolute path on the host filesystem.");
abs_path!(
    ContainerPath,
    "An absolute path inside the container filesystem."
);

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

impl fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative() {
        assert!(HostPath::try_from("proj/src").is_err());
        assert!(ContainerPath::try_from("./x").is_err());
        assert!(HostPath::try_from("/proj/src").is_ok());
    }

    #[test]
    fn cleans_dots() {
        let p = HostPath::try_from("/a/./b/../c").unwrap();
        assert_eq!(p.as_path(), Path::new("/a/c"));
    }

    #[test]
    fn join_cleans() {
        let base = HostPath::try_from("/proj").unwrap();
        assert_eq!(base.join("./src/../lib").as_path(), Path::new("/proj/lib"));
    }

    #[test]
    fn relative_to() {
        let base = HostPath::try_from("/proj").unwrap();
        let inner = HostPath::try_from("/proj/a/b").unwrap();
        let outer = HostPath::try_from("/other").unwrap();
        assert_eq!(inner.relative_to(&base), Some(Path::new("a/b")));
        assert_eq!(base.relative_to(&base), Some(Path::new("")));
        assert_eq!(outer.relative_to(&base), None);
    }
}
