//! Named savepoints: an additional ergonomic surface over the engine's
//! `SAVEPOINT`/`RELEASE SAVEPOINT`/`ROLLBACK TO SAVEPOINT`, kept from the
//! teacher's dedicated `savepoint.rs` module (supplement to §4.5 — nested
//! `Transaction::begin` gives implicit savepoint-like semantics, but named
//! savepoints are additional control flow the distillation's Non-goals don't
//! exclude).

use crate::error::{Error, Result};
use crate::session::Session;

/// A guard over one named savepoint: releases on drop unless
/// [`Savepoint::rollback`] was called first.
pub struct Savepoint<'sess> {
    session: &'sess Session,
    name: String,
    active: bool,
}

impl<'sess> Savepoint<'sess> {
    pub(crate) fn new(session: &'sess Session, name: &str) -> Result<Self> {
        validate_name(name)?;
        session
            .connection()?
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(|e| Error::from_rusqlite(e, None))?;
        Ok(Savepoint {
            session,
            name: name.to_string(),
            active: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `RELEASE SAVEPOINT <name>`, folding its changes into the enclosing
    /// transaction.
    pub fn release(mut self) -> Result<()> {
        self.finish("RELEASE SAVEPOINT")
    }

    /// `ROLLBACK TO SAVEPOINT <name>`, undoing its changes but keeping the
    /// enclosing transaction open.
    pub fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK TO SAVEPOINT")
    }

    fn finish(&mut self, verb: &str) -> Result<()> {
        self.session
            .connection()?
            .execute_batch(&format!("{verb} {}", self.name))
            .map_err(|e| Error::from_rusqlite(e, None))?;
        self.active = false;
        Ok(())
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Ok(conn) = self.session.connection() {
                let _ = conn.execute_batch(&format!("RELEASE SAVEPOINT {}", self.name));
            }
        }
    }
}

/// Non-empty, ASCII alphanumeric/underscore, not digit-led (teacher's
/// `validate_savepoint_name` rule).
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(Error::sql("invalid savepoint name", Some(name))),
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::sql("invalid savepoint name", Some(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn open_fixture() -> Session {
        let mut session = Session::new();
        session.open(":memory:").unwrap();
        session
            .exec("CREATE TABLE t (n INTEGER)", &[])
            .unwrap();
        session
    }

    #[test]
    fn release_keeps_changes() {
        let session = open_fixture();
        crate::transaction::Transaction::begin(&session, |txn| {
            session.exec("INSERT INTO t VALUES (1)", &[])?;
            let sp = txn.savepoint("sp1")?;
            session.exec("INSERT INTO t VALUES (2)", &[])?;
            sp.release()
        })
        .unwrap();
        let stmt = session.exec("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(stmt.row().get(0).as_i64(), 2);
    }

    #[test]
    fn rollback_to_savepoint_undoes_only_its_own_work() {
        let session = open_fixture();
        crate::transaction::Transaction::begin(&session, |txn| {
            session.exec("INSERT INTO t VALUES (1)", &[])?;
            let sp = txn.savepoint("sp1")?;
            session.exec("INSERT INTO t VALUES (2)", &[])?;
            sp.rollback()
        })
        .unwrap();
        let stmt = session.exec("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(stmt.row().get(0).as_i64(), 1);
    }

    #[test]
    fn rejects_digit_led_name() {
        assert!(validate_name("1abc").is_err());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(validate_name("").is_err());
    }

    #[test]
    fn accepts_underscore_and_alphanumeric() {
        assert!(validate_name("_my_sp_1").is_ok());
    }
}
