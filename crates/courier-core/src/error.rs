use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("precondition {0}")]
    Precondition(String),
    #[error("resolution {0}")]
    Resolution(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("crypto")]
    Crypto,
    #[error("storage")]
    Storage,
    #[error("media upload rejected with code {code}")]
    MediaUpload { code: u16 },
    #[error("not found")]
    NotFound,
}
