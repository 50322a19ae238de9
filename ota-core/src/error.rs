//! Error taxonomy shared by the upload pipeline and the file store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("requested {requested} bytes but only {available} bytes can be reserved")]
    InsufficientSpace { requested: u64, available: u32 },

    #[error("an update is already in progress")]
    AlreadyInProgress,

    #[error("failed to open sink: {0}")]
    OpenFailure(String),

    #[error("short write: {written} of {expected} bytes accepted")]
    WriteShortCount { expected: usize, written: usize },

    #[error("image validation failed: {0}")]
    ValidationFailure(String),

    #[error("upload aborted")]
    Aborted,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl UploadError {
    /// HTTP status code the dispatcher should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            UploadError::BadRequest(_) => 400,
            UploadError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("no space left on store")]
    NoSpace,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => UploadError::NotFound(path),
            StoreError::InvalidPath(path) => UploadError::BadRequest(format!("invalid path '{path}'")),
            other => UploadError::OpenFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(UploadError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(UploadError::NotFound("/a".into()).status_code(), 404);
        assert_eq!(UploadError::AlreadyInProgress.status_code(), 500);
        assert_eq!(
            UploadError::InsufficientSpace { requested: 10, available: 4 }.status_code(),
            500
        );
    }

    #[test]
    fn test_store_error_conversion() {
        let err: UploadError = StoreError::NotFound("/x".into()).into();
        assert!(matches!(err, UploadError::NotFound(p) if p == "/x"));

        let err: UploadError = StoreError::InvalidPath("../etc".into()).into();
        assert_eq!(err.status_code(), 400);

        let err: UploadError = StoreError::NoSpace.into();
        assert!(matches!(err, UploadError::OpenFailure(_)));
    }
}
