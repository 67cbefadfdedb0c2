use std::{error::Error as StdError, time::Duration};

/// Crate-wide result type for collaborator calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds shared by every backend and store implementation.
///
/// A timeout is reported separately from a rejected call so callers can
/// apply different retry rules.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The call did not complete within its bound.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Backend unreachable (connect/DNS/TLS failure).
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    /// Backend answered with a non-success status.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Response body did not have the expected shape.
    #[error("could not decode backend response: {message}")]
    Decode { message: String },

    /// Wrapped source error from a store or other dependency.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

pub type BackendError = Error;

impl Error {
    #[must_use]
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn rejected(status: u16, message: impl std::fmt::Display) -> Self {
        Self::Rejected {
            status,
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn decode(message: impl std::fmt::Display) -> Self {
        Self::Decode {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err)
    }
}

/// Run `fut` with an upper bound, mapping elapsed time to [`Error::Timeout`].
pub async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, after)),
    }
}
