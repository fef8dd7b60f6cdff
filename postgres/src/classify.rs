//! SQLSTATE-based error classification.
//!
//! Every storage error the executor sees is classified once, here, into a
//! small taxonomy that drives two independent decisions: whether the
//! transaction is worth retrying, and whether the failure counts against
//! the circuit breaker. Classification is pure; it never touches the
//! database or the clock.

const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
const SQLSTATE_CLASS_CONNECTION: &str = "08";
const SQLSTATE_CLASS_INTEGRITY: &str = "23";
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// Why a storage error happened, as far as retry policy is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorReason {
    /// Serialization failure (SQLSTATE 40001); safe to retry
    Serialization,
    /// Deadlock detected (SQLSTATE 40P01); safe to retry
    Deadlock,
    /// Connection-level failure (SQLSTATE class 08 or a client-side
    /// transport/pool error); safe to retry, counts against the breaker
    Connection,
    /// Integrity constraint violation (SQLSTATE class 23); a domain
    /// signal, never retried
    Constraint,
    /// Anything else; never retried
    Unknown,
}

impl DbErrorReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Serialization => "serialization",
            Self::Deadlock => "deadlock",
            Self::Connection => "connection",
            Self::Constraint => "constraint",
            Self::Unknown => "unknown",
        }
    }
}

/// Classification of one storage error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbErrorClassification {
    /// The failure taxonomy bucket
    pub reason: DbErrorReason,
    /// The SQLSTATE, when the server reported one
    pub sql_state: Option<String>,
    /// Whether the enclosing transaction may be retried
    pub retryable: bool,
    /// Whether the failure indicates the backend is unreachable or
    /// degraded; only these count against the circuit breaker
    pub is_connection_issue: bool,
}

impl DbErrorClassification {
    const fn new(reason: DbErrorReason, sql_state: Option<String>) -> Self {
        let (retryable, is_connection_issue) = match reason {
            DbErrorReason::Serialization | DbErrorReason::Deadlock => (true, false),
            DbErrorReason::Connection => (true, true),
            DbErrorReason::Constraint | DbErrorReason::Unknown => (false, false),
        };
        Self {
            reason,
            sql_state,
            retryable,
            is_connection_issue,
        }
    }
}

/// Classify a storage error.
///
/// Server-reported errors are classified by SQLSTATE; client-side transport
/// and pool failures never carry one and are all connection issues.
#[must_use]
pub fn classify(err: &sqlx::Error) -> DbErrorClassification {
    match err {
        sqlx::Error::Database(db) => {
            let state = db.code().map(|c| c.to_string());
            match state {
                Some(s) => DbErrorClassification::new(reason_for_sql_state(&s), Some(s)),
                None => DbErrorClassification::new(DbErrorReason::Unknown, None),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DbErrorClassification::new(DbErrorReason::Connection, None),
        _ => DbErrorClassification::new(DbErrorReason::Unknown, None),
    }
}

/// Map a SQLSTATE to a failure reason.
#[must_use]
pub fn reason_for_sql_state(sql_state: &str) -> DbErrorReason {
    if sql_state == SQLSTATE_SERIALIZATION_FAILURE {
        DbErrorReason::Serialization
    } else if sql_state == SQLSTATE_DEADLOCK_DETECTED {
        DbErrorReason::Deadlock
    } else if sql_state.starts_with(SQLSTATE_CLASS_CONNECTION) {
        DbErrorReason::Connection
    } else if sql_state.starts_with(SQLSTATE_CLASS_INTEGRITY) {
        DbErrorReason::Constraint
    } else {
        DbErrorReason::Unknown
    }
}

/// Whether the error is a unique-constraint violation (SQLSTATE 23505).
#[must_use]
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|c| c.as_ref() == SQLSTATE_UNIQUE_VIOLATION),
        _ => false,
    }
}

/// Name of the constraint that fired, when the server reported one.
///
/// Used to tell apart which unique index rejected an insert (idempotency
/// key reuse vs. an occupied slot).
#[must_use]
pub fn unique_constraint_name(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) => db.constraint(),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn serialization_failure_is_retryable() {
        assert_eq!(
            reason_for_sql_state("40001"),
            DbErrorReason::Serialization
        );
        let c = DbErrorClassification::new(DbErrorReason::Serialization, None);
        assert!(c.retryable);
        assert!(!c.is_connection_issue);
    }

    #[test]
    fn deadlock_is_retryable() {
        assert_eq!(reason_for_sql_state("40P01"), DbErrorReason::Deadlock);
        let c = DbErrorClassification::new(DbErrorReason::Deadlock, None);
        assert!(c.retryable);
        assert!(!c.is_connection_issue);
    }

    #[test]
    fn connection_class_counts_against_breaker() {
        for state in ["08000", "08003", "08006", "08001"] {
            assert_eq!(reason_for_sql_state(state), DbErrorReason::Connection);
        }
        let c = DbErrorClassification::new(DbErrorReason::Connection, None);
        assert!(c.retryable);
        assert!(c.is_connection_issue);
    }

    #[test]
    fn constraint_violations_are_never_retried() {
        for state in ["23505", "23503", "23502", "23514"] {
            assert_eq!(reason_for_sql_state(state), DbErrorReason::Constraint);
        }
        let c = DbErrorClassification::new(DbErrorReason::Constraint, None);
        assert!(!c.retryable);
        assert!(!c.is_connection_issue);
    }

    #[test]
    fn unknown_states_are_fatal() {
        for state in ["42601", "53300", "XX000"] {
            assert_eq!(reason_for_sql_state(state), DbErrorReason::Unknown);
        }
        let c = DbErrorClassification::new(DbErrorReason::Unknown, None);
        assert!(!c.retryable);
        assert!(!c.is_connection_issue);
    }

    #[test]
    fn pool_and_io_errors_are_connection_issues() {
        let c = classify(&sqlx::Error::PoolTimedOut);
        assert_eq!(c.reason, DbErrorReason::Connection);
        assert!(c.retryable);
        assert!(c.is_connection_issue);
        assert!(c.sql_state.is_none());

        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify(&io).reason, DbErrorReason::Connection);
    }

    #[test]
    fn row_not_found_is_unknown() {
        let c = classify(&sqlx::Error::RowNotFound);
        assert_eq!(c.reason, DbErrorReason::Unknown);
        assert!(!c.retryable);
    }

    #[test]
    fn unique_violation_requires_database_error() {
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
        assert!(unique_constraint_name(&sqlx::Error::RowNotFound).is_none());
    }
}
