use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::StoreError;

/// Error type for image-level administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No image file at the given path.
    #[error("segment image not found: {0}")]
    MissingImage(PathBuf),
    /// Formatting would overwrite an existing file.
    #[error("segment image already exists: {0}")]
    ImageExists(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Storage core error.
    #[error(transparent)]
    Core(#[from] StoreError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_image(path: impl AsRef<Path>) -> Self {
        AdminError::MissingImage(path.as_ref().to_path_buf())
    }
}
