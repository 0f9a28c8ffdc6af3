/// Reasons for a version-history listing to fail.
///
/// Listing failures are fatal to a run: the caller discards any partially
/// accumulated history rather than acting on an incomplete picture.
#[derive(Debug)]
pub enum ListError {
    /// A cancellation token aborted the listing.
    Cancelled,
    /// A timeout happened while executing a request.
    Timeout,
    /// The listing failed for another reason.
    Other(anyhow::Error),
}

impl std::fmt::Display for ListError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListError::Cancelled => write!(f, "Cancelled, shutting down"),
            ListError::Timeout => write!(f, "timeout"),
            ListError::Other(e) => write!(f, "Failed to list object versions: {e:?}"),
        }
    }
}

impl std::error::Error for ListError {}

impl ListError {
    /// Returns true if the error should not be retried.
    pub fn is_permanent(&self) -> bool {
        use ListError::*;
        match self {
            Cancelled => true,
            Timeout | Other(_) => false,
        }
    }
}

/// Reasons for a single rollback operation (copy or delete) to fail.
///
/// These are carried on the per-action result record and never abort the
/// run as a whole.
#[derive(Debug)]
pub enum ApplyError {
    /// The provider rejected the operation's precondition: another writer
    /// touched the object after it was listed. Reported, never retried.
    PreconditionFailed,
    /// The key or the requested source version is gone from the bucket.
    NotFound,
    /// A cancellation token aborted the operation.
    Cancelled,
    /// A timeout happened while executing the request.
    Timeout,
    /// The operation failed for another reason.
    Other(anyhow::Error),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::PreconditionFailed => {
                write!(f, "precondition failed: object was modified after listing")
            }
            ApplyError::NotFound => write!(f, "No object found for the key and version given"),
            ApplyError::Cancelled => write!(f, "Cancelled, shutting down"),
            ApplyError::Timeout => write!(f, "timeout"),
            ApplyError::Other(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for ApplyError {}

impl ApplyError {
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, ApplyError::PreconditionFailed)
    }
}
