use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors. Threshold misses, low-quality sources and unreadable inputs
/// are reported as outcome data instead (see `engine::RunStatus`).
#[derive(Error, Debug)]
pub enum VariantError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("fingerprint length mismatch: {left} bits vs {right} bits")]
    FingerprintLength { left: u32, right: u32 },

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("hashing failed: {0}")]
    Hash(String),

    #[error("transform {family} failed: {detail}")]
    Transform { family: String, detail: String },

    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("accepted-set invariant violated for {image}: {detail}")]
    InvariantViolation { image: String, detail: String },

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("{path}: {source}")]
    AtImage {
        path: PathBuf,
        #[source]
        source: Box<VariantError>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VariantError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn at_image(path: impl Into<PathBuf>, source: VariantError) -> Self {
        Self::AtImage { path: path.into(), source: Box::new(source) }
    }
}

pub type Result<T> = std::result::Result<T, VariantError>;
