use std::convert::From;
use std::fmt;
use std::io;

use trust_dns_resolver::error::ResolveError;

use crate::builder::BuildError;
use crate::queue::QueueError;
use crate::storage::PoolStorageError;

#[derive(Debug)]
pub enum Error {
    /// A pool storage operation failed. `not_found` is set when the targeted
    /// row no longer exists, which callers treat as a benign race.
    Storage { message: String, not_found: bool },
    LockPoisoned,
    Queue(QueueError),
    Codec(serde_json::Error),
    Build(BuildError),
    Resolver(ResolveError),
    Config(String),
    Io(io::Error),
    TaskPanicked(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(*self, Error::Storage { not_found: true, .. })
    }

    /// Errors after which a stage cannot keep looping
    pub fn is_fatal(&self) -> bool {
        matches!(*self, Error::LockPoisoned | Error::TaskPanicked(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Storage { ref message, .. } => write!(f, "storage error: {}", message),
            Error::LockPoisoned => write!(f, "storage lock poisoned"),
            Error::Queue(ref e) => write!(f, "queue error: {}", e),
            Error::Codec(ref e) => write!(f, "payload codec error: {}", e),
            Error::Build(ref e) => write!(f, "email build error: {}", e),
            Error::Resolver(ref e) => write!(f, "resolver error: {}", e),
            Error::Config(ref s) => write!(f, "invalid configuration: {}", s),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::TaskPanicked(ref name) => write!(f, "task {} panicked", name),
        }
    }
}

impl std::error::Error for Error {}

impl<S: PoolStorageError> From<S> for Error {
    fn from(e: S) -> Error {
        Error::Storage {
            message: format!("{}", e),
            not_found: e.is_not_found(),
        }
    }
}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Error {
        Error::Queue(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Codec(e)
    }
}

impl From<BuildError> for Error {
    fn from(e: BuildError) -> Error {
        Error::Build(e)
    }
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Error {
        Error::Resolver(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Error {
        Error::Config(format!("{}", e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
