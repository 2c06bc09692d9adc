use std::path::PathBuf;

/// Errors raised while publishing a site to a remote store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("Publish target is missing required option: {key}")]
    Configuration { key: String },

    #[error("Invalid publish target: {0}")]
    InvalidTarget(String),

    #[error("Unknown backend engine: {0}")]
    UnknownEngine(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Local file does not exist: {}", path.display())]
    LocalFileMissing { path: PathBuf },

    #[error("Failed to upload {remote_path}: {message}")]
    Upload {
        remote_path: String,
        message: String,
    },

    #[error("Remote file {url} failed hash check for {} after {attempts} attempt(s)", path.display())]
    Verification {
        path: PathBuf,
        url: String,
        attempts: u32,
    },

    #[error("Failed to delete remote file {remote_path}: {message}")]
    Deletion {
        remote_path: String,
        message: String,
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Publishing cancelled: {0}")]
    Cancelled(String),
}

impl PublishError {
    /// Shorthand for a missing required option.
    pub fn missing_option(key: impl Into<String>) -> Self {
        Self::Configuration { key: key.into() }
    }

    /// Deletion failures are reported but leave completed uploads valid.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Deletion { .. })
    }
}

impl From<std::io::Error> for PublishError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PublishError>;
