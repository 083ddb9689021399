use thiserror::Error;

pub type Result<T> = std::result::Result<T, OdooError>;

#[derive(Debug, Error)]
pub enum OdooError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Record does not exist: {0}")]
    MissingRecord(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Client setup error: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for OdooError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OdooError::Timeout
        } else if err.is_decode() {
            OdooError::Parse(err.to_string())
        } else {
            OdooError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for OdooError {
    fn from(err: serde_json::Error) -> Self {
        OdooError::Parse(err.to_string())
    }
}
