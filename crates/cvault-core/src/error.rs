use serde::Serialize;
use thiserror::Error;

pub type CvaultResult<T> = Result<T, CvaultError>;

#[derive(Debug, Error)]
pub enum CvaultError {
    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("transform unavailable: {0}")]
    TransformUnavailable(String),

    #[error("storage write failure: {0}")]
    StorageWriteFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable, serializable classification of a [`CvaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownKey,
    AuthenticationFailure,
    AlreadyExists,
    TransformUnavailable,
    StorageWriteFailure,
    NotFound,
    Forbidden,
    InvalidInput,
    Metadata,
    Config,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownKey => "unknown_key",
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::TransformUnavailable => "transform_unavailable",
            ErrorKind::StorageWriteFailure => "storage_write_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Metadata => "metadata",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CvaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CvaultError::UnknownKey(_) => ErrorKind::UnknownKey,
            CvaultError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            CvaultError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CvaultError::TransformUnavailable(_) => ErrorKind::TransformUnavailable,
            CvaultError::StorageWriteFailure(_) => ErrorKind::StorageWriteFailure,
            CvaultError::NotFound(_) => ErrorKind::NotFound,
            CvaultError::Forbidden(_) => ErrorKind::Forbidden,
            CvaultError::InvalidInput(_) => ErrorKind::InvalidInput,
            CvaultError::Metadata(_) => ErrorKind::Metadata,
            CvaultError::Config(_) => ErrorKind::Config,
            CvaultError::Io(_) => ErrorKind::Io,
            CvaultError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Errors that abort an upload instead of being absorbed by local fallback.
    pub fn is_fatal_for_upload(&self) -> bool {
        matches!(
            self,
            CvaultError::AuthenticationFailure(_)
                | CvaultError::StorageWriteFailure(_)
                | CvaultError::Metadata(_)
                | CvaultError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let err = CvaultError::StorageWriteFailure("disk full".into());
        assert_eq!(err.kind(), ErrorKind::StorageWriteFailure);
        assert_eq!(
            serde_json::to_string(&err.kind()).unwrap(),
            "\"storage_write_failure\""
        );
        assert_eq!(err.kind().to_string(), "storage_write_failure");
    }

    #[test]
    fn fatal_classification() {
        assert!(CvaultError::AuthenticationFailure("tag".into()).is_fatal_for_upload());
        assert!(CvaultError::StorageWriteFailure("io".into()).is_fatal_for_upload());
        assert!(!CvaultError::TransformUnavailable("no gpu".into()).is_fatal_for_upload());
        assert!(!CvaultError::UnknownKey("k".into()).is_fatal_for_upload());
    }
}
