//! Mapping from driver errors to the storage error taxonomy.

use eventry_core::error::Error;

/// Classify a [`sqlx::Error`], tagging the message with `context`.
///
/// Unique-constraint violations become [`Error::AlreadyExists`] so the
/// optimistic commit loop can tell a revision conflict from an outage;
/// connection-level failures become [`Error::Unavailable`], the one retryable
/// kind.
pub(crate) fn classify(error: sqlx::Error, context: &str) -> Error {
    match error {
        sqlx::Error::RowNotFound => Error::not_found(format!("{context}: row not found")),
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                Error::already_exists(format!("{context}: {db}"))
            } else if db.code().as_deref() == Some("57014") {
                // query_canceled, raised by statement_timeout
                Error::deadline_exceeded(format!("{context}: {db}"))
            } else {
                Error::internal(format!("{context}: {db}"))
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::unavailable(format!("{context}: {error}")),
        error => Error::internal(format!("{context}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use eventry_core::error::ErrorKind;

    use super::classify;

    #[test]
    fn io_errors_are_unavailable() {
        let error = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        let classified = classify(error, "save events");
        assert_eq!(classified.kind(), ErrorKind::Unavailable);
        assert!(classified.is_retryable());
        assert!(classified.to_string().contains("save events"));
    }

    #[test]
    fn pool_exhaustion_is_unavailable() {
        assert_eq!(
            classify(sqlx::Error::PoolTimedOut, "begin").kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            classify(sqlx::Error::PoolClosed, "begin").kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn missing_rows_are_not_found() {
        let classified = classify(sqlx::Error::RowNotFound, "latest snapshot");
        assert_eq!(classified.kind(), ErrorKind::NotFound);
        assert!(!classified.is_retryable());
    }

    #[test]
    fn unclassified_errors_are_internal() {
        let classified = classify(sqlx::Error::ColumnNotFound("data".into()), "list events");
        assert_eq!(classified.kind(), ErrorKind::Internal);
    }
}
