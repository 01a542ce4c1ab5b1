//! Mount operations.
//!
//! Executes a mount plan as bind mounts under a container root. Requires
//! `CAP_SYS_ADMIN` in the current mount namespace.

use std::fs;
use std::path::{Path, PathBuf};

use berth_common::{BerthError, BerthResult};

use crate::volume::PlannedMount;

/// Where a container mount target lands under `container_root` on the host.
pub fn host_target(container_root: &Path, target: &Path) -> PathBuf {
    container_root.join(target.strip_prefix("/").unwrap_or(target))
}

/// Bind mount a path.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path, readonly: bool) -> BerthResult<()> {
    use rustix::mount::{mount_bind, mount_change, mount_remount, MountFlags, MountPropagationFlags};

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        readonly,
        "Creating bind mount"
    );

    mount_bind(source, target).map_err(|e| BerthError::Io(e.into()))?;

    // Keep container mounts from propagating back to the host.
    mount_change(target, MountPropagationFlags::PRIVATE).map_err(|e| BerthError::Io(e.into()))?;

    if readonly {
        mount_remount(target, MountFlags::BIND | MountFlags::RDONLY, "")
            .map_err(|e| BerthError::Io(e.into()))?;
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path, _readonly: bool) -> BerthResult<()> {
    Err(BerthError::Unsupported {
        feature: "bind mounts".to_string(),
    })
}

/// Unmount a filesystem, detaching it if busy.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> BerthResult<()> {
    use rustix::mount::{unmount, UnmountFlags};

    tracing::debug!(target = %target.display(), "Unmounting filesystem");
    unmount(target, UnmountFlags::DETACH).map_err(|e| BerthError::Io(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> BerthResult<()> {
    Err(BerthError::Unsupported {
        feature: "unmount".to_string(),
    })
}

fn prepare_mountpoint(source: &Path, target: &Path) -> BerthResult<()> {
    if target.exists() {
        return Ok(());
    }
    if source.is_dir() {
        fs::create_dir_all(target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(target)?;
    }
    Ok(())
}

/// Execute `plan` against `container_root`, in order.
///
/// Returns the host paths mounted, in mount order. If any mount fails, the
/// ones already made are unmounted before the error is returned.
pub fn execute_plan(container_root: &Path, plan: &[PlannedMount]) -> BerthResult<Vec<PathBuf>> {
    let mut mounted = Vec::with_capacity(plan.len());

    for entry in plan {
        let target = host_target(container_root, &entry.target);
        let result = prepare_mountpoint(&entry.source, &target)
            .and_then(|()| bind_mount(&entry.source, &target, entry.read_only));

        if let Err(e) = result {
            tracing::warn!(
                target = %target.display(),
                error = %e,
                "Mount failed, undoing earlier mounts"
            );
            if let Err(undo) = teardown(&mounted) {
                tracing::warn!(error = %undo, "Failed to undo mounts");
            }
            return Err(e);
        }
        mounted.push(target);
    }

    tracing::info!(root = %container_root.display(), mounts = mounted.len(), "Mount plan executed");
    Ok(mounted)
}

/// Unmount paths returned by [`execute_plan`], children first.
pub fn teardown(mounted: &[PathBuf]) -> BerthResult<()> {
    let mut first_error = None;
    for target in mounted.iter().rev() {
        if let Err(e) = unmount(target) {
            tracing::warn!(target = %target.display(), error = %e, "Failed to unmount");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
