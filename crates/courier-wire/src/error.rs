use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid jid {0}")]
    InvalidJid(String),
    #[error("unknown server {0}")]
    UnknownServer(String),
}
