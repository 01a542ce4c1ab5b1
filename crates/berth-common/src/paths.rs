//! Standard filesystem paths for berth.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default root directory for berth data.
pub static BERTH_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BERTH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/berth"))
});

/// Name of the directory holding a volume's data inside its volume directory.
pub const VOLUME_DATA_DIR: &str = "_data";

/// Standard paths used by berth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerthPaths {
    /// Root data directory (default: /var/lib/berth).
    pub root: PathBuf,
}

impl BerthPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for container records.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Container state file.
    #[must_use]
    pub fn container_state(&self, id: &str) -> PathBuf {
        self.container(id).join("state.json")
    }

    /// Directory for images.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Root filesystem of a named image.
    #[must_use]
    pub fn image_rootfs(&self, name: &str) -> PathBuf {
        self.images().join(name).join("rootfs")
    }

    /// Volumes directory.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Directory for a specific volume.
    #[must_use]
    pub fn volume(&self, id: &str) -> PathBuf {
        self.volumes().join(id)
    }

    /// Backing storage of a volume, as handed to containers.
    #[must_use]
    pub fn volume_data(&self, id: &str) -> PathBuf {
        self.volume(id).join(VOLUME_DATA_DIR)
    }

    /// Durable record of a volume.
    #[must_use]
    pub fn volume_record(&self, id: &str) -> PathBuf {
        self.volume(id).join("record.json")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.containers())?;
        std::fs::create_dir_all(self.images())?;
        std::fs::create_dir_all(self.volumes())?;
        Ok(())
    }
}

impl Default for BerthPaths {
    fn default() -> Self {
        Self {
            root: BERTH_ROOT.clone(),
        }
    }
}
