use crate::error::FetchError;

/// Resolution of a single work item.
///
/// Exactly one outcome is produced per item of a batch.
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
    /// The fetcher produced a value.
    Success(T),
    /// The fetcher, or the engine on its behalf, reported a failure.
    Failure(FetchError),
    /// The item was resolved by cancellation before it produced a value.
    Cancelled,
}

impl<T> FetchOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::Failure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchOutcome::Cancelled)
    }

    pub fn as_success(&self) -> Option<&T> {
        match self {
            FetchOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&FetchError> {
        match self {
            FetchOutcome::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the kind of this outcome, without its payload.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            FetchOutcome::Success(_) => OutcomeKind::Success,
            FetchOutcome::Failure(_) => OutcomeKind::Failure,
            FetchOutcome::Cancelled => OutcomeKind::Cancelled,
        }
    }
}

impl<T> From<Result<T, FetchError>> for FetchOutcome<T> {
    fn from(result: Result<T, FetchError>) -> Self {
        match result {
            Ok(value) => FetchOutcome::Success(value),
            Err(err) => FetchOutcome::Failure(err),
        }
    }
}

/// Payload-free classification of a [`FetchOutcome`], mostly useful for logging and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Success,
    Failure,
    Cancelled,
}
