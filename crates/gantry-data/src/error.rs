use thiserror::Error;

/// Failures raised inside a backend driver. They stop at the orchestrator,
/// which logs them and hands callers a [`gantry_common::GantryError`].
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("unknown location: {0}")]
    UnknownLocation(String),
    #[error("{operation} is not supported by {backend}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;
