//! Declared mount specifications and their resolved form.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use berth_common::{BerthError, BerthResult, VolumeId};
use serde::{Deserialize, Serialize};

use super::record::VolumeKind;

/// Direct mapping of a host path into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindSpec {
    /// Absolute host path. Owned by the host, never deleted by berth.
    pub host_path: PathBuf,
    /// Mount point inside the container.
    pub target: PathBuf,
    /// Read-only mount.
    #[serde(default)]
    pub read_only: bool,
}

/// One declared mount of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountSpec {
    /// Named volume, created on first reference.
    Named {
        /// User-chosen volume name.
        name: String,
        /// Mount point inside the container.
        target: PathBuf,
        /// Read-only mount.
        #[serde(default)]
        read_only: bool,
    },
    /// Fresh volume with a generated identity.
    Anonymous {
        /// Mount point inside the container.
        target: PathBuf,
    },
    /// Host bind mount.
    Bind(BindSpec),
}

impl MountSpec {
    /// Mount point inside the container, as declared.
    #[must_use]
    pub fn target(&self) -> &Path {
        match self {
            Self::Named { target, .. } | Self::Anonymous { target } => target,
            Self::Bind(bind) => &bind.target,
        }
    }
}

/// Parses Docker's short `-v` syntax:
///
/// - `/target`: anonymous volume
/// - `name:/target[:ro|:rw]`: named volume
/// - `/host/path:/target[:ro|:rw]`: bind mount (source starts with `/` or `.`)
impl FromStr for MountSpec {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();

        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => return Err(BerthError::invalid_spec(s, "too many ':' separated fields")),
        };

        if target.is_empty() {
            return Err(BerthError::invalid_spec(s, "missing container path"));
        }

        let read_only = match mode {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(BerthError::invalid_spec(
                    s,
                    format!("unknown mode '{other}', expected 'ro' or 'rw'"),
                ));
            }
        };

        let target = PathBuf::from(target);
        let spec = match source {
            None => Self::Anonymous { target },
            Some("") => return Err(BerthError::invalid_spec(s, "empty source")),
            Some(src) if src.starts_with('/') || src.starts_with('.') => Self::Bind(BindSpec {
                host_path: PathBuf::from(src),
                target,
                read_only,
            }),
            Some(name) => Self::Named {
                name: name.to_string(),
                target,
                read_only,
            },
        };

        Ok(spec)
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = |ro: bool| if ro { ":ro" } else { "" };
        match self {
            Self::Named {
                name,
                target,
                read_only,
            } => write!(f, "{name}:{}{}", target.display(), mode(*read_only)),
            Self::Anonymous { target } => write!(f, "{}", target.display()),
            Self::Bind(bind) => write!(
                f,
                "{}:{}{}",
                bind.host_path.display(),
                bind.target.display(),
                mode(bind.read_only)
            ),
        }
    }
}

/// Ordered mounts of one container. Later entries shadow earlier ones at
/// equal target paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerMountSet(Vec<MountSpec>);

impl ContainerMountSet {
    /// Create a mount set from specs in declaration order.
    #[must_use]
    pub fn new(specs: Vec<MountSpec>) -> Self {
        Self(specs)
    }

    /// Parse a list of short-syntax specs.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> BerthResult<Self> {
        specs
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<BerthResult<Vec<_>>>()
            .map(Self)
    }

    /// Iterate specs in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, MountSpec> {
        self.0.iter()
    }

    /// Number of specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a ContainerMountSet {
    type Item = &'a MountSpec;
    type IntoIter = std::slice::Iter<'a, MountSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<MountSpec> for ContainerMountSet {
    fn from_iter<I: IntoIterator<Item = MountSpec>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Where a resolved mount's contents come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountSource {
    /// A volume tracked by the reference store.
    Volume {
        /// Volume identity.
        id: VolumeId,
        /// Named or anonymous.
        kind: VolumeKind,
    },
    /// A host path; untracked.
    Bind,
}

/// A mount after resolution: concrete host path, normalized target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMount {
    /// Origin of the contents.
    pub source: MountSource,
    /// Host path backing the mount.
    pub host_path: PathBuf,
    /// Normalized mount point inside the container.
    pub target: PathBuf,
    /// Read-only mount.
    pub read_only: bool,
}

impl ResolvedMount {
    /// The tracked volume behind this mount, if any.
    #[must_use]
    pub fn volume(&self) -> Option<(&VolumeId, VolumeKind)> {
        match &self.source {
            MountSource::Volume { id, kind } => Some((id, *kind)),
            MountSource::Bind => None,
        }
    }
}

/// Lexically normalize an absolute container path.
///
/// `.` components and repeated or trailing separators are dropped. `..` is
/// rejected rather than resolved. The root itself is accepted.
pub fn normalize_container_path(path: &Path) -> Result<PathBuf, String> {
    if !path.is_absolute() {
        return Err(format!("'{}' is not an absolute path", path.display()));
    }

    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                return Err(format!("'{}' contains '..'", path.display()));
            }
            Component::Prefix(_) => {
                return Err(format!("'{}' has a platform prefix", path.display()));
            }
        }
    }
    Ok(normalized)
}

/// Normalize a mount target; unlike [`normalize_container_path`] the root is
/// not a valid mount point.
pub fn normalize_target(spec: &MountSpec) -> BerthResult<PathBuf> {
    let target = normalize_container_path(spec.target())
        .map_err(|reason| BerthError::invalid_spec(spec.to_string(), reason))?;
    if target == Path::new("/") {
        return Err(BerthError::invalid_spec(
            spec.to_string(),
            "cannot mount over the container root",
        ));
    }
    Ok(target)
}
