//! Nested transactions with automatic busy-retry and commit/rollback hook
//! queues (§4.5).
//!
//! The outer-frame stack described in §3 as a linked list of
//! `Transaction` back-pointers is modeled here as a plain depth counter on
//! [`Session`] (§9: "model these as non-owning references... or a raw borrow
//! with explicit lifetime"): since a `Transaction`'s body closure must return
//! before its caller's frame continues, the nesting depth at any moment is
//! exactly what the call stack already encodes, and the only information the
//! stack link carries beyond that (which frame is "outermost") reduces to
//! whether depth was zero at this frame's entry. The retry loop itself is
//! grounded on `DecapodLabs-decapod`'s `pool.rs` busy-retry idiom.

use crate::error::{Error, Result};
use crate::savepoint::Savepoint;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Committed,
    RolledBack,
}

/// A unit of atomic work, possibly nested (§3, §4.5).
pub struct Transaction<'sess> {
    session: Option<&'sess Session>,
    nested: bool,
    depth_before: u32,
    state: State,
}

impl<'sess> Transaction<'sess> {
    /// Open a frame on `session` and invoke `body`. Retries the whole body
    /// from scratch when it raises [`Error::Busy`] at the outermost frame; a
    /// Busy raised from a nested frame propagates unchanged (invariant #10,
    /// §8).
    ///
    /// `body`'s side effects outside the database will re-execute on retry;
    /// it must be safe to re-run (§9).
    pub fn begin<F, T>(session: &'sess Session, mut body: F) -> Result<T>
    where
        F: FnMut(&Transaction<'sess>) -> Result<T>,
    {
        loop {
            let mut txn = Transaction::open(session)?;
            match body(&txn) {
                Ok(value) => {
                    txn.commit()?;
                    return Ok(value);
                }
                Err(Error::Busy) if !txn.nested => {
                    txn.rollback();
                    continue;
                }
                Err(e) => {
                    txn.rollback();
                    return Err(e);
                }
            }
        }
    }

    fn open(session: &'sess Session) -> Result<Self> {
        let depth_before = session.tx_depth();
        let nested = depth_before > 0;
        if !nested {
            session
                .connection()?
                .execute_batch("BEGIN")
                .map_err(|e| Error::from_rusqlite(e, None))?;
        }
        session.push_transaction();
        Ok(Transaction {
            session: Some(session),
            nested,
            depth_before,
            state: State::Active,
        })
    }

    pub fn active(&self) -> bool {
        self.session.is_some()
    }

    pub fn nested(&self) -> bool {
        self.nested
    }

    pub fn committed(&self) -> bool {
        self.state == State::Committed
    }

    pub fn rolled_back(&self) -> bool {
        self.state == State::RolledBack
    }

    /// Open a named savepoint (supplement to §4.5; teacher: `savepoint.rs`).
    pub fn savepoint(&self, name: &str) -> Result<Savepoint<'sess>> {
        let session = self
            .session
            .ok_or_else(|| Error::sql("no active transaction", None))?;
        Savepoint::new(session, name)
    }

    /// If active and outermost: `COMMIT`, drain commit hooks, discard
    /// rollback hooks. If active and nested: unlink without touching the
    /// engine. Idempotent.
    pub fn commit(&mut self) -> Result<()> {
        let Some(session) = self.session else {
            return Ok(());
        };
        if !self.nested {
            session
                .connection()?
                .execute_batch("COMMIT")
                .map_err(|e| Error::from_rusqlite(e, None))?;
            session.drain_commit_hooks();
        }
        session.pop_transaction_to(self.depth_before);
        self.session = None;
        self.state = State::Committed;
        Ok(())
    }

    /// If the engine still reports a live transaction, `ROLLBACK`; drains
    /// rollback hooks in LIFO order and discards commit hooks. Idempotent.
    pub fn rollback(&mut self) {
        let Some(session) = self.session else {
            return;
        };
        if let Ok(conn) = session.connection() {
            if !conn.is_autocommit() {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
        session.pop_transaction_to(self.depth_before);
        session.drain_rollback_hooks();
        self.session = None;
        self.state = State::RolledBack;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.rollback();
        }
    }
}
