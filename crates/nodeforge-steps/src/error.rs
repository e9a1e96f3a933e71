//! Mapping host errors onto step error kinds

use nodeforge_host::HostError;
use nodeforge_workflow::{ErrorKind, PollError, StepError};

/// Turn a [`HostError`] into a [`StepError`] of the given kind.
///
/// Cancellation and expired waits keep their own kinds regardless of
/// `kind`, so callers can always tell an interrupted run from a broken one.
pub fn classify(err: HostError, kind: ErrorKind) -> StepError {
    match err {
        HostError::Poll(PollError::Timeout(after)) => StepError::Timeout(after),
        HostError::Poll(PollError::Cancelled) => StepError::Cancelled,
        err if err.is_cancelled() => StepError::Cancelled,
        err => StepError::from_kind(kind, err.to_string()),
    }
}

/// `.kind(ErrorKind::Installation)?` on host results
pub trait HostResultExt<T> {
    fn kind(self, kind: ErrorKind) -> Result<T, StepError>;
}

impl<T> HostResultExt<T> for Result<T, HostError> {
    fn kind(self, kind: ErrorKind) -> Result<T, StepError> {
        self.map_err(|err| classify(err, kind))
    }
}
