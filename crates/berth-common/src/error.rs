//! Common error types for berth.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BerthError`].
pub type BerthResult<T> = Result<T, BerthError>;

/// Errors raised by the volume subsystem and the runtime around it.
#[derive(Error, Diagnostic, Debug)]
pub enum BerthError {
    /// A mount specification is malformed or cannot be resolved.
    #[error("Invalid mount spec '{spec}': {reason}")]
    #[diagnostic(
        code(berth::mount::invalid_spec),
        help("Use '/target', 'name:/target[:ro]' or '/host/path:/target[:ro]'")
    )]
    InvalidMountSpec {
        /// The offending spec, as declared.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A volume cannot be removed because containers still reference it.
    #[error("Volume in use: {name} (referenced by {})", .containers.join(", "))]
    #[diagnostic(
        code(berth::volume::in_use),
        help("Remove the containers using this volume first")
    )]
    VolumeInUse {
        /// The volume identity.
        name: String,
        /// Containers currently holding a reference.
        containers: Vec<String>,
    },

    /// Volume not found.
    #[error("Volume not found: {name}")]
    #[diagnostic(code(berth::volume::not_found))]
    VolumeNotFound {
        /// The volume identity that was not found.
        name: String,
    },

    /// Host-side allocation or deletion of volume storage failed.
    #[error("Backing storage failure at {}: {source}", .path.display())]
    #[diagnostic(code(berth::volume::storage))]
    BackingStorageFailure {
        /// The host path being allocated or deleted.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A path inside a container view is not usable.
    #[error("Invalid container path '{path}': {reason}")]
    #[diagnostic(code(berth::path::invalid))]
    InvalidPath {
        /// The path as given.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(berth::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// A container with this ID already exists.
    #[error("Container already exists: {id}")]
    #[diagnostic(code(berth::container::exists))]
    ContainerExists {
        /// The conflicting container ID.
        id: String,
    },

    /// The container's status does not allow the operation.
    #[error("Container {id} cannot be {action} (status: {status})")]
    #[diagnostic(code(berth::container::state))]
    InvalidContainerState {
        /// The container ID.
        id: String,
        /// The refused operation, as a past participle.
        action: &'static str,
        /// Current status.
        status: String,
    },

    /// Image not found.
    #[error("Image not found: {reference}")]
    #[diagnostic(
        code(berth::image::not_found),
        help("Images are root filesystem directories under <root>/images/<name>/rootfs")
    )]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(berth::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(berth::unsupported), help("Executing mount plans requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(berth::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(berth::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(berth::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(berth::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl BerthError {
    /// Shorthand for [`BerthError::InvalidMountSpec`].
    pub fn invalid_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMountSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error raised while touching volume storage.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::BackingStorageFailure {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        BerthError::Serialization(err.to_string())
    }
}
