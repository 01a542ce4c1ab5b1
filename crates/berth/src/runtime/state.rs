//! Container state persistence.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use berth_common::{BerthError, BerthPaths, BerthResult, ContainerId};

use super::container::ContainerRecord;

/// Manages container state persistence.
#[derive(Debug)]
pub struct StateManager {
    paths: BerthPaths,
}

impl StateManager {
    /// Create a new state manager over the `containers/` tree of `paths`.
    pub fn new(paths: BerthPaths) -> Self {
        Self { paths }
    }

    /// Get the path to a container's state file.
    pub fn state_path(&self, container_id: &str) -> PathBuf {
        self.paths.container_state(container_id)
    }

    /// Save container state, replacing the previous file atomically.
    pub fn save(&self, record: &ContainerRecord) -> BerthResult<()> {
        let path = self.state_path(record.id.as_str());
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.paths.container(record.id.as_str()));
        fs::create_dir_all(&dir).map_err(|e| BerthError::storage(&dir, e))?;

        let json = serde_json::to_vec_pretty(record)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| BerthError::storage(&dir, e))?;
        tmp.write_all(&json).map_err(|e| BerthError::storage(&path, e))?;
        tmp.persist(&path)
            .map_err(|e| BerthError::storage(&path, e.error))?;

        tracing::debug!(
            container_id = %record.id,
            path = %path.display(),
            "Saved container state"
        );

        Ok(())
    }

    /// Load container state.
    pub fn load(&self, container_id: &str) -> BerthResult<ContainerRecord> {
        let path = self.state_path(container_id);

        if !path.exists() {
            return Err(BerthError::ContainerNotFound {
                id: container_id.to_string(),
            });
        }

        let json = fs::read_to_string(&path)?;
        let record: ContainerRecord = serde_json::from_str(&json)?;

        tracing::debug!(
            container_id = %container_id,
            path = %path.display(),
            "Loaded container state"
        );

        Ok(record)
    }

    /// Delete container state.
    pub fn delete(&self, container_id: &ContainerId) -> BerthResult<()> {
        let container_dir = self.paths.container(container_id.as_str());

        match fs::remove_dir_all(&container_dir) {
            Ok(()) => {
                tracing::debug!(
                    container_id = %container_id,
                    path = %container_dir.display(),
                    "Deleted container state"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BerthError::storage(container_dir, e)),
        }
    }

    /// List the IDs of all persisted containers.
    pub fn list(&self) -> BerthResult<Vec<String>> {
        let mut containers = Vec::new();

        let state_dir = self.paths.containers();
        if !state_dir.exists() {
            return Ok(containers);
        }

        for entry in fs::read_dir(&state_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if self.state_path(name).exists() {
                        containers.push(name.to_string());
                    }
                }
            }
        }

        containers.sort();
        Ok(containers)
    }

    /// Check if a container has persisted state, readable or not.
    pub fn exists(&self, container_id: &ContainerId) -> bool {
        self.state_path(container_id.as_str()).exists()
    }
}
