use thiserror::Error;

/// Crate-wide error type. Mirrors the error-kind taxonomy used across the
/// gateway's device and transport layers so callers can match on kind
/// instead of parsing message text.
#[derive(Debug, Error)]
pub enum GwError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("instrument error: {0}")]
    Instrument(String),

    #[error("bug: {0}")]
    Bug(String),
}

pub type GwResult<T> = Result<T, GwError>;
