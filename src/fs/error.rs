use thiserror::Error;

pub type SourceResult<T> = Result<T, SourceError>;

/// Errors surfaced by mount sources and the path index.
///
/// Absence from `lookup` is not an error: lookups return `Ok(None)`.
/// `NotFound` is only produced by operations that require the path to
/// exist, such as `list`.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn not_a_file(path: impl Into<String>) -> Self {
        Self::NotAFile(path.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptArchive(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }

    /// Convert to POSIX errno
    pub fn to_errno(&self) -> i32 {
        match self {
            SourceError::NotFound(_) => libc::ENOENT,
            SourceError::NotADirectory(_) => libc::ENOTDIR,
            SourceError::NotAFile(_) => libc::EISDIR,
            SourceError::Unsupported(_) => libc::ENOTSUP,
            SourceError::InvalidPath(_) => libc::EINVAL,
            SourceError::Index(_) | SourceError::CorruptArchive(_) => libc::EIO,
            SourceError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<sqlx::Error> for SourceError {
    fn from(e: sqlx::Error) -> Self {
        SourceError::Index(e.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Index(format!("invalid locator: {}", e))
    }
}

impl From<zip::result::ZipError> for SourceError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => SourceError::Io(io),
            zip::result::ZipError::UnsupportedArchive(msg) => {
                SourceError::Unsupported(msg.to_string())
            }
            zip::result::ZipError::FileNotFound => {
                SourceError::CorruptArchive("zip entry vanished".to_string())
            }
            other => SourceError::CorruptArchive(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for SourceError {
    fn from(e: tokio::task::JoinError) -> Self {
        SourceError::Io(std::io::Error::other(e))
    }
}
