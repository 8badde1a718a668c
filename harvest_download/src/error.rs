use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl Error {
    /// HTTP status carried by the failed response, when there was one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::NetworkError(err) => err.status().map(|status| status.as_u16()),
            Error::IOError(_) => None,
        }
    }
}
