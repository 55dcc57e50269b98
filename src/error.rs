//! Error types for the scheduling runtime.

use std::sync::Arc;

use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during submission scheduling and synchronization.
///
/// `Failed` is special: it carries a retained status behind an `Arc` so that a
/// terminal semaphore failure can be handed to every current and future waiter
/// without copying the diagnostic.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Malformed parameters (non-monotonic signal, zero queue count, ...).
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// Arena or allocator failure; the submission unwinds cleanly.
    #[snafu(display("resource exhausted: {reason}"))]
    ResourceExhausted { reason: String },

    /// A blocking wait ran past its deadline.
    #[snafu(display("deadline exceeded: {reason}"))]
    DeadlineExceeded { reason: String },

    /// Backend-specific execution failure.
    #[snafu(display("unavailable: {reason}"))]
    Unavailable { reason: String },

    /// Terminal failure carrying the originally retained status.
    #[snafu(display("failed: {status}"))]
    Failed { status: Arc<Error> },
}

impl Error {
    /// Wrap `self` for retention in a failure slot, flattening nested `Failed`
    /// layers so the original diagnostic is the one that propagates.
    pub fn retained(self) -> Arc<Error> {
        match self {
            Error::Failed { status } => status,
            other => Arc::new(other),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument { .. })
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Error::Failed { .. })
    }
}
