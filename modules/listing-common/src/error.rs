use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid scrape request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
