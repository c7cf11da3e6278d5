use thiserror::Error;

/// KitForge error types
#[derive(Error, Debug)]
pub enum KitError {
    /// Malformed model reference
    #[error("invalid reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Malformed or unrecognized layer media type
    #[error("{0}")]
    InvalidMediaType(String),

    /// Malformed unpack filter
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Kitfile failed validation
    #[error("invalid Kitfile: {0}")]
    InvalidKitfile(String),

    /// Manifest, blob, tag, or Kitfile is absent
    #[error("{0} not found")]
    NotFound(String),

    /// Digest or size mismatch on stored or transferred content
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The registry or configuration does not support the requested operation
    #[error("{0}")]
    Unsupported(String),

    /// A modelkit reference chain revisited a reference
    #[error("found cycle in modelkit references: {0}")]
    CycleDetected(String),

    /// A modelkit reference chain exceeded the maximum depth
    #[error("reached maximum number of model references: [{0}]")]
    DepthExceeded(String),

    /// A path resolved outside of its declared root
    #[error("illegal path '{path}': outside of {root}")]
    PathEscape { root: String, path: String },

    /// Target file exists and overwriting was not requested
    #[error("path '{0}' already exists")]
    Conflict(String),

    /// Operation was canceled
    #[error("operation canceled")]
    Canceled,

    /// Transport failure, including failures after retries
    #[error("network error: {0}")]
    Network(String),

    /// Non-retryable HTTP error from a registry
    #[error("registry error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Local store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KitError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            KitError::Network(_) => true,
            KitError::Server { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for KitError {
    fn from(err: serde_json::Error) -> Self {
        KitError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KitError {
    fn from(err: serde_yaml::Error) -> Self {
        KitError::Serialization(err.to_string())
    }
}

/// Result type alias for KitForge operations
pub type Result<T> = std::result::Result<T, KitError>;
