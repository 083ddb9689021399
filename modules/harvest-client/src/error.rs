use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Client setup error: {0}")]
    Setup(String),
}

impl HarvestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HarvestError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HarvestError::Timeout
        } else if err.is_decode() {
            HarvestError::Parse(err.to_string())
        } else {
            HarvestError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::Parse(err.to_string())
    }
}
