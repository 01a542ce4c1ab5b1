//! Volume drivers own the host side of a volume's backing storage.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Allocates and destroys backing storage for volumes.
///
/// The store calls into the driver while holding the volume's lock, so
/// implementations must not call back into the store.
pub trait VolumeDriver: Send + Sync + fmt::Debug {
    /// Driver name, recorded on every volume it allocates.
    fn name(&self) -> &str;

    /// Make `data_dir` ready for use as an empty volume.
    fn allocate(&self, data_dir: &Path) -> io::Result<()>;

    /// Delete `data_dir` and everything below it.
    fn destroy(&self, data_dir: &Path) -> io::Result<()>;
}

/// Plain directories on the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDriver;

impl VolumeDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    fn allocate(&self, data_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(data_dir, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    fn destroy(&self, data_dir: &Path) -> io::Result<()> {
        match fs::remove_dir_all(data_dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Local driver whose operations can be made to fail on demand.
    #[derive(Debug)]
    pub(crate) struct FlakyDriver {
        allocations_left: AtomicUsize,
        destroy_fails: AtomicBool,
    }

    impl Default for FlakyDriver {
        fn default() -> Self {
            Self {
                allocations_left: AtomicUsize::new(usize::MAX),
                destroy_fails: AtomicBool::new(false),
            }
        }
    }

    impl FlakyDriver {
        pub(crate) fn fail_allocate(&self, fail: bool) {
            let budget = if fail { 0 } else { usize::MAX };
            self.allocations_left.store(budget, Ordering::SeqCst);
        }

        /// Let `n` more allocations succeed, then fail the rest.
        pub(crate) fn fail_allocate_after(&self, n: usize) {
            self.allocations_left.store(n, Ordering::SeqCst);
        }

        pub(crate) fn fail_destroy(&self, fail: bool) {
            self.destroy_fails.store(fail, Ordering::SeqCst);
        }
    }

    impl VolumeDriver for FlakyDriver {
        fn name(&self) -> &str {
            "flaky"
        }

        fn allocate(&self, data_dir: &Path) -> io::Result<()> {
            let granted = self
                .allocations_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !granted {
                return Err(io::Error::other("injected allocation failure"));
            }
            LocalDriver.allocate(data_dir)
        }

        fn destroy(&self, data_dir: &Path) -> io::Result<()> {
            if self.destroy_fails.load(Ordering::SeqCst) {
                return Err(io::Error::other("injected deletion failure"));
            }
            LocalDriver.destroy(data_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn local_driver_round_trip() {
        let temp = tempdir().unwrap();
        let data = temp.path().join("vol").join("_data");

        LocalDriver.allocate(&data).unwrap();
        std::fs::write(data.join("file.txt"), "hello").unwrap();
        assert!(data.is_dir());

        LocalDriver.destroy(&data).unwrap();
        assert!(!data.exists());
    }

    #[test]
    fn destroying_missing_storage_is_ok() {
        let temp = tempdir().unwrap();
        assert!(LocalDriver.destroy(&temp.path().join("gone")).is_ok());
    }
}
