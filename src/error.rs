use std::fmt;

/// Errors surfaced by the discovery engine and its handle.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The engine's command channel is momentarily full; retry the call.
    Again,

    /// A generic error message.
    Msg(String),

    /// A name server address failed to parse.
    ParseAddr(String),

    /// A filter glob failed to compile.
    InvalidPattern(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Again => write!(f, "engine busy, try again"),
            Error::Msg(s) => write!(f, "{}", s),
            Error::ParseAddr(s) => write!(f, "bad name server address: {}", s),
            Error::InvalidPattern(s) => write!(f, "bad filter pattern: {}", s),
        }
    }
}

impl std::error::Error for Error {}

/// Result type used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;
