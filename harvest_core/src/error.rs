use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unknown status: {0}")]
    UnknownStatus(String),
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Object `{0}` not found")]
    ObjectNotFound(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] diesel::ConnectionError),

    #[error("Cannot encode/decode JSON: {0}")]
    JSONError(#[from] serde_json::Error),
    #[error("Cannot parse URL: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("Cannot parse date: {0}")]
    DateError(#[from] chrono::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
