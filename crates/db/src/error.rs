//! Mapping of driver errors onto [`TenancyError`].
//!
//! Connection-level failures become `ConnectionLost` so callers can tell a
//! retryable outage from a statement the server rejected.

use sea_orm::{DbErr, RuntimeErr};
use tessera_core::TenancyError;

/// `duplicate_schema`
pub const DUPLICATE_SCHEMA: &str = "42P06";
/// `invalid_schema_name` (also raised for a missing schema)
pub const INVALID_SCHEMA_NAME: &str = "3F000";
/// `read_only_sql_transaction`
pub const READ_ONLY_TRANSACTION: &str = "25006";

/// Converts a SeaORM error into a tenancy error.
#[must_use]
pub fn map_db_err(err: DbErr) -> TenancyError {
    match &err {
        DbErr::ConnectionAcquire(_) => TenancyError::ConnectionLost(err.to_string()),
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e))
            if is_connection_error(e) =>
        {
            TenancyError::ConnectionLost(err.to_string())
        }
        DbErr::Conn(_) => TenancyError::ConnectionLost(err.to_string()),
        _ => TenancyError::Database(err.to_string()),
    }
}

/// Converts a raw sqlx error into a tenancy error.
#[must_use]
pub fn map_sqlx_err(err: sqlx::Error) -> TenancyError {
    if is_connection_error(&err) {
        TenancyError::ConnectionLost(err.to_string())
    } else {
        TenancyError::Database(err.to_string())
    }
}

/// SQLSTATE reported by the server, if the error came from a statement.
#[must_use]
pub fn sqlstate(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => e
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::error::ConnAcquireErr;

    #[test]
    fn test_pool_exhaustion_is_connection_lost() {
        let err = map_db_err(DbErr::ConnectionAcquire(ConnAcquireErr::Timeout));
        assert!(matches!(err, TenancyError::ConnectionLost(_)));
    }

    #[test]
    fn test_io_failure_is_connection_lost() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = map_db_err(DbErr::Exec(RuntimeErr::SqlxError(sqlx::Error::Io(io))));
        assert!(matches!(err, TenancyError::ConnectionLost(_)));
    }

    #[test]
    fn test_other_errors_are_database_errors() {
        let err = map_db_err(DbErr::Custom("boom".into()));
        assert!(matches!(err, TenancyError::Database(msg) if msg.contains("boom")));
        assert!(matches!(
            map_sqlx_err(sqlx::Error::RowNotFound),
            TenancyError::Database(_)
        ));
    }

    #[test]
    fn test_sqlstate_absent_without_server_error() {
        assert_eq!(sqlstate(&DbErr::Custom("x".into())), None);
        assert_eq!(
            sqlstate(&DbErr::Exec(RuntimeErr::SqlxError(sqlx::Error::PoolClosed))),
            None
        );
    }
}
