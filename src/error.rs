//! Error taxonomy for the access layer.
//!
//! Three kinds leak from this crate, matching the engine's own split between
//! "something went wrong", "you interrupted me", and "try again":
//! [`Error::Sql`], [`Error::Interrupt`], and [`Error::Busy`]. Nothing else is
//! ever returned to a caller.

use std::fmt;

/// The library's single error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Preparation or execution failure: syntactic, semantic, a constraint
    /// violation, I/O, or any other engine-reported failure not covered by
    /// the two variants below.
    #[error("{kind}{sql}", sql = SqlSuffix(.sql.as_deref()))]
    Sql {
        kind: SqlFailureKind,
        sql: Option<String>,
    },

    /// Raised in the executing thread when [`crate::Session::interrupt`] was
    /// called while a statement was stepping.
    #[error("interrupted")]
    Interrupt,

    /// Raised when the engine reports contention, or a potential deadlock
    /// that the internal unlock-wait did not resolve.
    #[error("database is busy")]
    Busy,
}

/// The narrative message carried by a [`Error::Sql`], kept distinct from the
/// `Display` impl so callers that only care about the message (not the SQL
/// text) aren't forced to parse it back out.
#[derive(Debug, Clone)]
pub struct SqlFailureKind(pub String);

impl fmt::Display for SqlFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct SqlSuffix<'a>(Option<&'a str>);

impl fmt::Display for SqlSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(sql) => write!(f, " (sql: {sql})"),
            None => Ok(()),
        }
    }
}

impl Error {
    /// Build a generic [`Error::Sql`] with an explicit message, optionally
    /// naming the SQL text being processed.
    pub fn sql(message: impl Into<String>, sql: Option<&str>) -> Self {
        Error::Sql {
            kind: SqlFailureKind(message.into()),
            sql: sql.map(str::to_owned),
        }
    }

    pub(crate) fn from_rusqlite(err: rusqlite::Error, sql: Option<&str>) -> Self {
        use rusqlite::ErrorCode;
        if let rusqlite::Error::SqliteFailure(raw, ref msg) = err {
            match raw.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => return Error::Busy,
                ErrorCode::OperationInterrupted => return Error::Interrupt,
                _ => {
                    let detail = msg.clone().unwrap_or_else(|| raw.to_string());
                    return Error::sql(detail, sql);
                }
            }
        }
        Error::sql(err.to_string(), sql)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::from_rusqlite(err, None)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
