//! Error taxonomy shared by every layer above the storage boundary.
//!
//! Backend errors are translated into one of these kinds exactly once, by the
//! storage implementation. Everything else in the crate reasons only in terms
//! of the kind: the commit loop retries on [`Error::AlreadyExists`], the
//! snapshot path falls back on [`Error::NotFound`], and the registry pager
//! retries on [`Error::Unavailable`].

/// Classified error carrying a human-readable detail string.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint was violated, typically a revision collision.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The request itself is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is not valid in the current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// A budget (failure count, retry limit) has been used up.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Connection-class failure; safe to retry.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The operation ran out of time or was cancelled.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// Invariant violation, codec failure, or unclassified backend error.
    #[error("internal: {0}")]
    Internal(String),
}

/// Discriminant of [`Error`], for matching and for failure-log rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name, used in persisted failure records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::InvalidArgument => "invalid_argument",
            Self::FailedPrecondition => "failed_precondition",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        }
    }
}

impl Error {
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound(detail.into())
    }

    pub fn already_exists(detail: impl Into<String>) -> Self {
        Self::AlreadyExists(detail.into())
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument(detail.into())
    }

    pub fn failed_precondition(detail: impl Into<String>) -> Self {
        Self::FailedPrecondition(detail.into())
    }

    pub fn resource_exhausted(detail: impl Into<String>) -> Self {
        Self::ResourceExhausted(detail.into())
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::Unavailable(detail.into())
    }

    pub fn deadline_exceeded(detail: impl Into<String>) -> Self {
        Self::DeadlineExceeded(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may retry the failed operation as-is.
    ///
    /// Only connection-class failures qualify; a conflict or precondition
    /// failure needs fresh state first.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
