//! Engine configuration.

use std::path::{Path, PathBuf};

use berth_common::{BerthError, BerthPaths, BerthResult};
use serde::Deserialize;

/// Engine configuration options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Paths for engine data.
    pub paths: BerthPaths,
    /// Whether running without root privileges.
    pub rootless: bool,
    /// Seed empty volumes from the image on first mount.
    pub copy_image_data: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            paths: BerthPaths::new(),
            rootless: false,
            copy_image_data: true,
        }
    }
}

/// On-disk form of [`EngineConfig`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    root: Option<PathBuf>,
    rootless: Option<bool>,
    copy_image_data: Option<bool>,
}

impl EngineConfig {
    /// Create a rootless configuration under the user's data directory.
    #[must_use]
    pub fn rootless() -> Self {
        let root = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("berth");

        Self {
            paths: BerthPaths::with_root(root),
            rootless: true,
            copy_image_data: true,
        }
    }

    /// Load a TOML configuration file, starting from the defaults.
    pub fn from_file(path: &Path) -> BerthResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BerthError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Parse a TOML configuration.
    pub fn from_toml(content: &str) -> BerthResult<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| BerthError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })?;

        let mut config = if file.rootless.unwrap_or(false) {
            Self::rootless()
        } else {
            Self::default()
        };
        if let Some(root) = file.root {
            config = config.with_root(root);
        }
        if let Some(copy) = file.copy_image_data {
            config.copy_image_data = copy;
        }
        Ok(config)
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = BerthPaths::with_root(root);
        self
    }

    /// Enable or disable seeding volumes from image contents.
    #[must_use]
    pub fn with_copy_image_data(mut self, copy: bool) -> Self {
        self.copy_image_data = copy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert!(!config.rootless);
        assert!(config.copy_image_data);
    }

    #[test]
    fn rootless_config() {
        let config = EngineConfig::rootless();
        assert!(config.rootless);
        assert!(config.paths.root().ends_with("berth"));
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::default()
            .with_root("/custom/root")
            .with_copy_image_data(false);

        assert_eq!(config.paths.root(), Path::new("/custom/root"));
        assert!(!config.copy_image_data);
    }

    #[test]
    fn parse_toml() {
        let config = EngineConfig::from_toml(
            r#"
            root = "/srv/berth"
            copy_image_data = false
            "#,
        )
        .unwrap();
        assert_eq!(config.paths.root(), Path::new("/srv/berth"));
        assert!(!config.copy_image_data);

        assert!(EngineConfig::from_toml("").unwrap().copy_image_data);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            EngineConfig::from_toml("timeout = 30"),
            Err(BerthError::Config { .. })
        ));
    }
}
