//! The error taxonomy shared by managers, handles, and backends.

/// Classifies every failure the library can surface.
///
/// Backends normalise their store-native failures into these kinds so that
/// callers never need to inspect store-specific responses. Competition for a
/// resource is *not* an error: acquisition paths report it by returning
/// `Ok(None)`, and [`Error::Conflict`] exists only for stores that model a
/// lost race as a thrown failure (managers recover from it locally).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An acquisition failed for a reason other than competition, such as a
    /// transport fault or an exhausted timeout budget.
    #[error("failed to acquire lease: {0}")]
    Acquisition(String),

    /// The resource is held by another owner.
    ///
    /// Recovered locally by [`LeaseManager::acquire`]; callers of
    /// `try_acquire` see `Ok(None)` instead.
    ///
    /// [`LeaseManager::acquire`]: crate::LeaseManager::acquire
    #[error("lease is held by another owner")]
    Conflict,

    /// A renewal attempt failed without proving loss of ownership. The
    /// renewal engine retries these.
    #[error("failed to renew lease: {0}")]
    Renewal(String),

    /// Ownership of the lease has definitively been lost: the store no
    /// longer recognises the lease id, retries were exhausted, or the
    /// safety threshold forbade another attempt. Terminal for the handle.
    #[error("lease lost: {0}")]
    Lost(String),

    /// The coordination store could not be reached or refused the request
    /// for an infrastructure reason.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// The operation targeted a handle that has already been released.
    #[error("lease handle has been released")]
    Disposed,

    /// The caller's cancellation handle fired while the operation was in
    /// flight.
    #[error("operation canceled")]
    Canceled,

    /// An input failed validation before any store call was made.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns true if this error conveys normal competition rather than an
    /// infrastructure failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict)
    }

    /// Returns true if this error is terminal for the owning handle.
    pub fn is_lost(&self) -> bool {
        matches!(self, Error::Lost(_))
    }
}
