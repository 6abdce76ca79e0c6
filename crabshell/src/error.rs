//! Error type shared by every stage of the hardening pipeline.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The resolver exhausted every location, or downloading/validating the
    /// tool failed after all retries.
    #[error("{tool} not found: {reason}")]
    ToolNotFound { tool: String, reason: String },

    /// Full and degraded (`-r`) decoding both failed.
    #[error("apktool could not decode {}: {source}", target.display())]
    DecodeFailure {
        target: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// The target is not a usable application package. Never retried.
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    /// Unreadable or malformed cache entry. Only used inside the cache,
    /// where it is downgraded to a miss.
    #[error("corrupt cache entry {}: {reason}", path.display())]
    CacheCorrupt { path: PathBuf, reason: String },

    /// Signing certificate fingerprint could not be determined and strict
    /// integrity was requested.
    #[error("signing certificate fingerprint unavailable: {0}")]
    IntegrityUnknown(String),

    /// A collaborator process exited non-zero.
    #[error(
        "{action} failed (status {status}). command={command} cwd={cwd}\n--- stdout (tail) ---\n{stdout_tail}\n--- stderr (tail) ---\n{stderr_tail}"
    )]
    ExternalTool {
        action: String,
        command: String,
        cwd: String,
        status: String,
        stdout_tail: String,
        stderr_tail: String,
    },

    #[error("download failed: {0}")]
    Download(String),

    #[error("invalid artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("key material: {0}")]
    KeyMaterial(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("xml error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<quick_xml::Error> for Error {
    fn from(error: quick_xml::Error) -> Self {
        Error::Xml(error.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(error: quick_xml::events::attributes::AttrError) -> Self {
        Error::Xml(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Download(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
