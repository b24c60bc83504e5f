use thiserror::Error;

/// Errors visible to callers of the data layer.
///
/// Backend-specific failures never appear here verbatim: they are logged where
/// they happen and surface as [`GantryError::InternalError`].
#[derive(Debug, Error)]
pub enum GantryError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("internal error")]
    InternalError,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("key management error: {0}")]
    KeyManagement(String),
    #[error("response closed by client request before all data sent")]
    ResponseClosed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("stream error: {0}")]
    Stream(#[source] std::io::Error),
}

impl GantryError {
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NoSuchKey",
            Self::InternalError => "InternalError",
            Self::Configuration(_) => "InternalError",
            Self::KeyManagement(_) => "KMS.KMSInternalException",
            Self::ResponseClosed => "RequestTimeout",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Stream(_) => "InternalError",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, GantryError>;
