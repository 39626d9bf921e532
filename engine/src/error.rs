use std::path::PathBuf;

use thiserror::Error;

/// Failures the workshop programs tell apart from everything else.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found at '{}'", .0.display())]
    NotFound(PathBuf),

    #[error("Missing tensor `{name}` in {}", .path.display())]
    MissingTensor { name: String, path: PathBuf },

    #[error("Device not available: {0}")]
    UnsupportedDevice(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error(
        "'{}' is a single-file checkpoint; expected a diffusers UNet weights file or model directory",
        .0.display()
    )]
    SingleFileCheckpoint(PathBuf),
}

impl ModelError {
    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}
