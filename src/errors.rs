use std::path::PathBuf;
use thiserror::Error;

/// Boxed source error carried by the variants that wrap third-party failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for mask generation.
///
/// The first three variants form the user-facing taxonomy (a missing file, a
/// missing config entry, an unusable combination of options). The rest carry
/// the failing operation alongside the underlying error so that the binary can
/// print a full cause chain.
#[derive(Error, Debug)]
pub enum MaskError {
    #[error("{what} not found at {path:?}")]
    FileNotFound { what: String, path: PathBuf },

    #[error("Missing field `{field}` in {path:?}")]
    MissingField { field: String, path: PathBuf },

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Failed to parse config file {path:?}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to download model asset {asset}")]
    Download {
        asset: String,
        #[source]
        source: BoxError,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MaskError>;

impl MaskError {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn file_not_found(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound {
            what: what.into(),
            path: path.into(),
        }
    }
}

/// Builds a `map_err` adapter that records the failing model operation.
///
/// ONNX Runtime errors are flattened to their message: the builder errors are
/// generic over the builder type and do not all satisfy `Send + Sync`.
pub fn model_error<E: std::fmt::Display>(operation: &str) -> impl FnOnce(E) -> MaskError + '_ {
    move |err| MaskError::Model {
        operation: operation.to_string(),
        source: err.to_string().into(),
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build `MaskError::FileSystem`
/// directly; this is the fallback for `?` on bare I/O calls.
impl From<std::io::Error> for MaskError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for MaskError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors only come out of tensor plumbing around inference, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for MaskError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
