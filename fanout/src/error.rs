//! Error types and result definitions for fan-out batches.
//!
//! Two layers of errors exist. [`FetchError`] describes why a single item could not be fetched;
//! it is data, stored in the aggregate next to the successful outcomes, and never aborts a batch.
//! [`FanOutError`] describes why a whole batch could not run (invalid configuration, malformed
//! input, a broken internal contract) and is the only error a batch call returns.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ValidationError;

/// Convenient result type for batch-level operations.
pub type FanOutResult<T> = Result<T, FanOutError>;

/// Reason a single item could not be fetched.
///
/// Produced by [`crate::fetcher::Fetcher`] implementations and forwarded unchanged by the
/// engine, except for [`FetchError::Timeout`] and [`FetchError::Unknown`] which the engine
/// itself produces when a fetch exceeds its deadline or panics.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The identifier cannot be turned into a request.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    /// The transport failed before a response was received.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] Arc<dyn error::Error + Send + Sync>),
    /// A response was received with a status other than success.
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    /// A response was received but carried no data.
    #[error("response carried no data")]
    EmptyData,
    /// The response data could not be decoded into the expected type.
    #[error("decode failure: {0}")]
    DecodeFailure(String),
    /// The fetch did not finish within the configured per-item timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// Any failure that fits no other category.
    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl FetchError {
    /// Wraps a transport error.
    pub fn transport<E>(err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        FetchError::TransportFailure(Arc::new(err))
    }
}

/// Detailed payload stored for single [`FanOutError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Batch-level error.
///
/// [`FanOutError`] can represent a single error with optional detail and source, or several
/// aggregated errors, for example when more than one worker of a batch panicked.
#[derive(Debug, Clone)]
pub struct FanOutError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<FanOutError>,
        location: &'static Location<'static>,
    },
}

/// Categories of batch-level errors.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The item set is malformed, for example it contains duplicates.
    InvalidInput,
    /// The batch configuration failed validation.
    ConfigError,
    /// No fetcher was supplied to the batch.
    FetcherUnavailable,
    /// An outcome was merged twice, after sealing, or never merged at all.
    AggregateMergeConflict,
    /// A blocking wait was attempted from within an async runtime.
    BlockingWaitInRuntime,
    /// A primitive was used outside of its lifecycle.
    InvalidState,
    /// A worker task panicked outside of the fetch it was running.
    WorkerPanic,
    Unknown,
}

impl FanOutError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the dynamic detail, or the first one available for aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured backtrace for single errors.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the callsite where this error was created.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
    ) -> Self {
        FanOutError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source: None,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for FanOutError {
    fn eq(&self, other: &FanOutError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for FanOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail: {detail}")?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                )?;

                for (index, error) in errors.iter().enumerate() {
                    for (line_index, line) in error.to_string().lines().enumerate() {
                        if line_index == 0 {
                            write!(f, "\n  {}. {}", index + 1, line)?;
                        } else {
                            write!(f, "\n     {line}")?;
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for FanOutError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Creates a [`FanOutError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for FanOutError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> FanOutError {
        FanOutError::from_components(kind, Cow::Borrowed(desc), None)
    }
}

/// Creates a [`FanOutError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for FanOutError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> FanOutError {
        FanOutError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()))
    }
}

/// Aggregates several errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for FanOutError
where
    E: Into<FanOutError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> FanOutError {
        let location = Location::caller();
        let mut errors: Vec<FanOutError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        FanOutError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<ValidationError> for FanOutError {
    #[track_caller]
    fn from(err: ValidationError) -> FanOutError {
        let detail = err.to_string();
        FanOutError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid fan-out configuration"),
            Some(Cow::Owned(detail)),
        )
        .with_source(err)
    }
}

impl From<tokio::task::JoinError> for FanOutError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> FanOutError {
        let detail = err.to_string();
        FanOutError::from_components(
            ErrorKind::WorkerPanic,
            Cow::Borrowed("Fan-out worker task failed"),
            Some(Cow::Owned(detail)),
        )
        .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;
    use crate::fanout_error;

    #[test]
    fn test_single_error_exposes_kind_and_detail() {
        let err = fanout_error!(ErrorKind::InvalidInput, "Duplicate item", "item 3");

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.detail(), Some("item 3"));
        assert!(err.backtrace().is_some());
        assert!(err.to_string().starts_with("[InvalidInput] Duplicate item @"));
    }

    #[test]
    fn test_many_errors_flatten_kinds() {
        let err = FanOutError::from(vec![
            fanout_error!(ErrorKind::WorkerPanic, "first"),
            fanout_error!(ErrorKind::AggregateMergeConflict, "second"),
        ]);

        assert_eq!(err.kind(), ErrorKind::WorkerPanic);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::WorkerPanic, ErrorKind::AggregateMergeConflict]
        );
        assert!(err.to_string().contains("2 errors aggregated"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_single_element_vec_is_unwrapped() {
        let err = FanOutError::from(vec![fanout_error!(ErrorKind::InvalidState, "only")]);

        assert_eq!(err, fanout_error!(ErrorKind::InvalidState, "other"));
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn test_validation_error_maps_to_config_error() {
        let err = FanOutError::from(ValidationError::MaxConcurrencyZero);

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_fetch_error_display_keeps_cause() {
        let io = std::io::Error::other("connection reset");
        let err = FetchError::transport(io);

        assert_eq!(err.to_string(), "transport failure: connection reset");
        assert!(err.source().is_some());
    }
}
