//! Mount overlay applier.
//!
//! Builds a container's effective filesystem view from the image rootfs and
//! its resolved mounts. Precedence is computed explicitly instead of relying
//! on the order mounts hit the kernel:
//!
//! - For any container path, the mount whose target is the longest
//!   component-wise prefix of that path owns it.
//! - On equal targets the later declaration wins and the earlier mount is
//!   fully shadowed.
//! - Paths under no mount come from the image.
//!
//! A narrower mount therefore always re-exposes its subtree beneath a broader
//! one, whichever order they were declared in.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use berth_common::{BerthError, BerthResult};
use serde::Serialize;
use walkdir::WalkDir;

use super::spec::{normalize_container_path, MountSource, ResolvedMount};

/// A mount that participates in the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountLayer {
    /// Position in the container's mount set.
    pub index: usize,
    /// Normalized mount point.
    pub target: PathBuf,
    /// Host path exposed at `target`.
    pub host_path: PathBuf,
    /// Origin of the contents.
    pub source: MountSource,
    /// Read-only mount.
    pub read_only: bool,
}

impl MountLayer {
    fn depth(&self) -> usize {
        self.target.components().count()
    }
}

/// Which layer a container path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// The image root filesystem.
    Image,
    /// A mount, by its position in the mount set.
    Mount(usize),
}

/// Where a container path lives on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The owning layer.
    pub layer: Layer,
    /// Host path backing the container path.
    pub host_path: PathBuf,
    /// Whether writes are refused at this path.
    pub read_only: bool,
}

/// One bind operation of a mount plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMount {
    /// Host path to bind.
    pub source: PathBuf,
    /// Mount point inside the container.
    pub target: PathBuf,
    /// Remount read-only after binding.
    pub read_only: bool,
}

/// The filesystem a container sees.
#[derive(Debug, Clone)]
pub struct EffectiveView {
    rootfs: PathBuf,
    layers: Vec<MountLayer>,
    shadowed: Vec<usize>,
}

impl EffectiveView {
    /// Compute the view of `mounts` layered over `rootfs`.
    pub fn new(rootfs: impl Into<PathBuf>, mounts: &[ResolvedMount]) -> Self {
        let mut layers = Vec::with_capacity(mounts.len());
        let mut shadowed = Vec::new();

        for (index, mount) in mounts.iter().enumerate() {
            let hidden = mounts[index + 1..]
                .iter()
                .any(|later| later.target == mount.target);
            if hidden {
                tracing::debug!(
                    target = %mount.target.display(),
                    index,
                    "Mount fully shadowed by a later mount"
                );
                shadowed.push(index);
                continue;
            }

            layers.push(MountLayer {
                index,
                target: mount.target.clone(),
                host_path: mount.host_path.clone(),
                source: mount.source.clone(),
                read_only: mount.read_only,
            });
        }

        Self {
            rootfs: rootfs.into(),
            layers,
            shadowed,
        }
    }

    /// Image root filesystem under the mounts.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Mounts that are visible somewhere in the view, in declaration order.
    pub fn layers(&self) -> &[MountLayer] {
        &self.layers
    }

    /// Mount-set positions of mounts hidden by a later mount at the same
    /// target.
    pub fn shadowed(&self) -> &[usize] {
        &self.shadowed
    }

    fn normalize(path: &Path) -> BerthResult<PathBuf> {
        normalize_container_path(path).map_err(|reason| BerthError::InvalidPath {
            path: path.display().to_string(),
            reason,
        })
    }

    fn owner(&self, path: &Path) -> Option<&MountLayer> {
        self.layers
            .iter()
            .filter(|layer| path.starts_with(&layer.target))
            .max_by_key(|layer| layer.depth())
    }

    /// Find the layer and host path behind a container path.
    pub fn resolve(&self, path: impl AsRef<Path>) -> BerthResult<Resolution> {
        let path = Self::normalize(path.as_ref())?;

        let resolution = match self.owner(&path) {
            Some(layer) => Resolution {
                layer: Layer::Mount(layer.index),
                host_path: join_relative(&layer.host_path, &path, &layer.target),
                read_only: layer.read_only,
            },
            None => Resolution {
                layer: Layer::Image,
                host_path: join_relative(&self.rootfs, &path, Path::new("/")),
                read_only: false,
            },
        };
        Ok(resolution)
    }

    /// Whether `path` is a mount point or an ancestor of one.
    fn leads_to_mount(&self, path: &Path) -> bool {
        self.layers.iter().any(|layer| layer.target.starts_with(path))
    }

    /// Whether a container path exists in the view.
    pub fn exists(&self, path: impl AsRef<Path>) -> BerthResult<bool> {
        let normalized = Self::normalize(path.as_ref())?;
        if self.leads_to_mount(&normalized) {
            return Ok(true);
        }
        Ok(self.resolve(&normalized)?.host_path.exists())
    }

    /// Whether writes are refused at a container path.
    pub fn is_read_only(&self, path: impl AsRef<Path>) -> BerthResult<bool> {
        Ok(self.resolve(path)?.read_only)
    }

    /// Sorted entry names of a directory in the view.
    ///
    /// Entries come from the owning layer, plus the first component of any
    /// deeper mount point below `path`.
    pub fn read_dir(&self, path: impl AsRef<Path>) -> BerthResult<Vec<String>> {
        let path = Self::normalize(path.as_ref())?;
        let resolution = self.resolve(&path)?;

        let mut entries = BTreeSet::new();
        match fs::read_dir(&resolution.host_path) {
            Ok(dir) => {
                for entry in dir {
                    entries.insert(entry?.file_name().to_string_lossy().into_owned());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.leads_to_mount(&path) => {}
            Err(e) => return Err(e.into()),
        }

        for layer in &self.layers {
            if layer.target == path {
                continue;
            }
            if let Ok(rest) = layer.target.strip_prefix(&path) {
                if let Some(first) = rest.components().next() {
                    entries.insert(first.as_os_str().to_string_lossy().into_owned());
                }
            }
        }

        Ok(entries.into_iter().collect())
    }

    /// Read a file through the view.
    pub fn read(&self, path: impl AsRef<Path>) -> BerthResult<Vec<u8>> {
        let resolution = self.resolve(path)?;
        Ok(fs::read(resolution.host_path)?)
    }

    /// Bind operations needed to realize the view, parents before children.
    ///
    /// Declaration order is kept among mounts of equal depth.
    pub fn mount_plan(&self) -> Vec<PlannedMount> {
        let mut layers: Vec<&MountLayer> = self.layers.iter().collect();
        layers.sort_by_key(|layer| layer.depth());
        layers
            .into_iter()
            .map(|layer| PlannedMount {
                source: layer.host_path.clone(),
                target: layer.target.clone(),
                read_only: layer.read_only,
            })
            .collect()
    }
}

fn join_relative(base: &Path, path: &Path, prefix: &Path) -> PathBuf {
    match path.strip_prefix(prefix) {
        Ok(rest) if rest.as_os_str().is_empty() => base.to_path_buf(),
        Ok(rest) => base.join(rest),
        Err(_) => base.to_path_buf(),
    }
}

/// Applies resolved mounts over an image at container start.
#[derive(Debug, Clone, Copy)]
pub struct MountOverlayApplier {
    copy_image_data: bool,
}

impl Default for MountOverlayApplier {
    fn default() -> Self {
        Self {
            copy_image_data: true,
        }
    }
}

impl MountOverlayApplier {
    /// Create an applier; `copy_image_data` enables seeding empty volumes
    /// from the image.
    #[must_use]
    pub fn new(copy_image_data: bool) -> Self {
        Self { copy_image_data }
    }

    /// Build the effective view, seeding empty volumes first.
    pub fn apply(&self, rootfs: &Path, mounts: &[ResolvedMount]) -> BerthResult<EffectiveView> {
        let view = EffectiveView::new(rootfs, mounts);

        if self.copy_image_data {
            for layer in view.layers() {
                if matches!(layer.source, MountSource::Bind) {
                    continue;
                }
                let image_dir = join_relative(rootfs, &layer.target, Path::new("/"));
                let copied = seed_volume(&image_dir, &layer.host_path)?;
                if copied > 0 {
                    tracing::info!(
                        target = %layer.target.display(),
                        volume = %layer.host_path.display(),
                        files = copied,
                        "Seeded volume from image"
                    );
                }
            }
        }

        tracing::debug!(
            rootfs = %rootfs.display(),
            layers = view.layers().len(),
            shadowed = view.shadowed().len(),
            "Applied mount overlay"
        );
        Ok(view)
    }
}

/// Copy the image's contents at a mount target into an empty volume.
///
/// Returns the number of files copied; a non-empty volume or an image
/// without that directory copies nothing.
fn seed_volume(image_dir: &Path, volume_dir: &Path) -> BerthResult<u64> {
    if !image_dir.is_dir() {
        return Ok(0);
    }

    let mut existing = fs::read_dir(volume_dir).map_err(|e| BerthError::storage(volume_dir, e))?;
    if existing.next().is_some() {
        return Ok(0);
    }

    copy_tree(image_dir, volume_dir).map_err(|e| BerthError::storage(volume_dir, e))
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut files = 0;
    let mut dirs = vec![(dst.to_path_buf(), fs::metadata(src)?.permissions())];

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let dest = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
            dirs.push((dest, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)?;
            files += 1;
        }
    }

    // Restrictive modes go on last so they cannot block the copy.
    for (dir, permissions) in dirs.into_iter().rev() {
        fs::set_permissions(dir, permissions)?;
    }

    Ok(files)
}
