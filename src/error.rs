use std::error::Error as StdError;
use std::fmt;
use std::result::Result as StdResult;
use std::sync::Arc;

/// The error type surfaced by checkouts and cascades.
///
/// A failure cascade completes every pending checkout with a clone of the
/// same error, hence the cause is shared.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn with_cause<E: StdError + Send + Sync + 'static>(kind: ErrorKind, cause: E) -> Self {
        Self {
            kind,
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A checkout did not get a connection within its deadline, or a
    /// single setup/refresh attempt ran out of its time budget.
    ExceededTimeLimit,
    /// The pool (or the endpoint pool serving the request) is shutting
    /// down.
    ShutdownInProgress,
    /// Connections were dropped by an external request, either for one
    /// endpoint or for a tag addressed group of pools.
    PooledConnectionsDropped,
    /// A connection reported an error while being set up or refreshed.
    ConnectionError,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ExceededTimeLimit => "could not get a connection within the time limit",
            ErrorKind::ShutdownInProgress => "the connection pool is shutting down",
            ErrorKind::PooledConnectionsDropped => "pooled connections dropped",
            ErrorKind::ConnectionError => "the connection failed",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref cause) = self.cause {
            write!(f, "{}: {}", self.kind.as_str(), cause)
        } else {
            f.write_str(self.kind.as_str())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type InitializationResult<T> = StdResult<T, InitializationError>;

/// An error that can occur while assembling a `Config`, e.g. from
/// malformed environment variables.
#[derive(Debug)]
pub struct InitializationError {
    message: String,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl InitializationError {
    pub fn new<T, E>(key: T, cause: Option<E>) -> Self
    where
        T: fmt::Display,
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: format!("could not initialize '{}'", key),
            cause: cause.map(|err| Box::new(err) as Box<dyn StdError + Send + Sync>),
        }
    }

    pub fn message_only<T: Into<String>>(message: T) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }
}

impl fmt::Display for InitializationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref cause) = self.cause {
            write!(f, "{}: {}", self.message, cause)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl StdError for InitializationError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn displays_kind_and_cause() {
        let err = Error::with_cause(
            ErrorKind::ConnectionError,
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer hung up"),
        );
        let displayed = err.to_string();
        assert!(displayed.contains("the connection failed"));
        assert!(displayed.contains("peer hung up"));
    }

    #[test]
    fn cascade_errors_clone() {
        let err = Error::new(ErrorKind::PooledConnectionsDropped);
        let clone = err.clone();
        assert_eq!(clone.kind(), ErrorKind::PooledConnectionsDropped);
    }
}
