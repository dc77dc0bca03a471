use std::fmt::Display;
use std::io;

/// Store errors.
#[derive(Debug)]
pub enum Error {
    /// On-disk state that cannot be parsed: bogus config record, impossible
    /// field values, truncated metadata. Usually triggers the one-shot
    /// config recovery path.
    Corrupted(String),
    /// A read or write ran past the end of a store file. Expected while a
    /// shrink is in progress; an error otherwise.
    Eof,
    /// Invalid caller input, e.g. attaching a secondary store that already
    /// chains to another one.
    InvalidInput(String),
    /// An IO error, including a configuration-lock timeout.
    IO(String),
    /// A `put` with `overwrite = false` found a different block stored under
    /// the same routing key.
    KeyCollision,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corrupted(msg) => write!(f, "corrupted store: {msg}"),
            Error::Eof => write!(f, "unexpected end of store file"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::KeyCollision => write!(f, "key collision, slot holds a different block"),
        }
    }
}

/// Constructs an Error::Corrupted for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupted(format!($($args)*)).into() };
}

/// A salthash Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::Eof
        } else {
            Error::IO(err.to_string())
        }
    }
}
