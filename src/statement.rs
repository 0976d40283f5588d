//! Prepared-statement lifecycle, typed parameter binding, and row iteration
//! (§4.3).
//!
//! A [`Statement`] wraps exactly one `rusqlite::Statement`/`CachedStatement`
//! at a time behind a `RefCell`, so every method takes `&self` — matching the
//! design note in §9 that a Statement is a non-owning back-reference handed
//! out by a Session rather than something the Session itself owns
//! exclusively. Explicit [`Statement::reset`]/[`Statement::clear_bindings`]
//! while a row is still live re-prepare the statement and replay the stored
//! bindings rather than reaching for a lower-level reset call: `rusqlite`
//! only resets a statement's engine-side cursor automatically when stepping
//! reaches DONE or an error (see [`StatementKind::step_once`]), so a manual
//! mid-iteration reset has nothing else to hook into without raw FFI.

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::utils::enhance_constraint_error;
use crate::value::Value;

/// Bound retries against a LOCKED status before giving up and surfacing
/// Busy; each attempt parks briefly in [`Session::wait_for_unlock`].
const MAX_LOCK_RETRIES: u32 = 200;

pub(crate) enum StatementKind<'sess> {
    Cached(rusqlite::CachedStatement<'sess>),
    Owned(rusqlite::Statement<'sess>),
}

impl<'sess> Deref for StatementKind<'sess> {
    type Target = rusqlite::Statement<'sess>;
    fn deref(&self) -> &Self::Target {
        match self {
            StatementKind::Cached(s) => s,
            StatementKind::Owned(s) => s,
        }
    }
}

impl<'sess> DerefMut for StatementKind<'sess> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            StatementKind::Cached(s) => s,
            StatementKind::Owned(s) => s,
        }
    }
}

enum StepOutcome {
    Row(Vec<Value>),
    Done,
    Locked,
    Busy,
    Interrupt,
    Error(rusqlite::Error),
}

impl<'sess> StatementKind<'sess> {
    /// Step once. Creating a fresh [`rusqlite::Rows`] per call is cheap (it
    /// is a thin adapter over the still-prepared statement) and lets the
    /// engine's own step/reset bookkeeping do the work; the real VM position
    /// lives in the statement handle, not in the `Rows` wrapper.
    fn step_once(&mut self) -> StepOutcome {
        let column_count = self.column_count();
        let mut rows = self.raw_query();
        match rows.next() {
            Ok(Some(row)) => {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    match row.get_ref(i) {
                        Ok(v) => values.push(Value::from(v)),
                        Err(e) => return StepOutcome::Error(e),
                    }
                }
                StepOutcome::Row(values)
            }
            Ok(None) => StepOutcome::Done,
            Err(e) => {
                if let rusqlite::Error::SqliteFailure(raw, _) = &e {
                    match raw.code {
                        rusqlite::ErrorCode::DatabaseLocked => return StepOutcome::Locked,
                        rusqlite::ErrorCode::DatabaseBusy => return StepOutcome::Busy,
                        rusqlite::ErrorCode::OperationInterrupted => {
                            return StepOutcome::Interrupt
                        }
                        _ => {}
                    }
                }
                StepOutcome::Error(e)
            }
        }
    }
}

/// A prepared statement bound to the [`Session`] that compiled it.
pub struct Statement<'sess> {
    session: &'sess Session,
    sql: String,
    registry_id: Option<u32>,
    kind: RefCell<Option<StatementKind<'sess>>>,
    active: Cell<bool>,
    bound: RefCell<Vec<Value>>,
    current_row: RefCell<Option<Vec<Value>>>,
}

impl<'sess> Statement<'sess> {
    pub(crate) fn new(
        session: &'sess Session,
        sql: String,
        registry_id: Option<u32>,
        kind: StatementKind<'sess>,
    ) -> Self {
        Statement {
            session,
            sql,
            registry_id,
            kind: RefCell::new(Some(kind)),
            active: Cell::new(false),
            bound: RefCell::new(Vec::new()),
            current_row: RefCell::new(None),
        }
    }

    fn finalized_error(&self) -> Error {
        Error::sql("statement is finalized", Some(&self.sql))
    }

    pub fn is_prepared(&self) -> bool {
        self.kind.borrow().is_some()
    }

    /// `active ⇒ prepared` is maintained by construction: `active` is only
    /// ever set while a `kind` is present, and any path that clears `kind`
    /// also clears `active` first.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn column_count(&self) -> usize {
        self.kind.borrow().as_ref().map_or(0, |k| k.column_count())
    }

    pub fn column_name(&self, index: usize) -> Option<String> {
        self.kind
            .borrow()
            .as_ref()
            .and_then(|k| k.column_name(index).ok().map(str::to_owned))
    }

    pub fn column_names(&self) -> Vec<String> {
        (0..self.column_count())
            .map(|i| self.column_name(i).unwrap_or_default())
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.kind.borrow().as_ref().map_or(0, |k| k.parameter_count())
    }

    /// Re-prepare from the stored SQL/registry id and replay every
    /// previously bound value. Used by [`Statement::reset`] and
    /// [`Statement::bind`]/[`Statement::clear_bindings`] on an active
    /// statement, since that is the only safe way this crate has to cancel
    /// an in-flight cursor without raw FFI.
    fn reprepare(&self) -> Result<()> {
        let conn = self.session.connection()?;
        let fresh = match self.registry_id {
            Some(_) => StatementKind::Cached(
                conn.prepare_cached(&self.sql)
                    .map_err(|e| Error::from_rusqlite(e, Some(&self.sql)))?,
            ),
            None => StatementKind::Owned(
                conn.prepare(&self.sql)
                    .map_err(|e| Error::from_rusqlite(e, Some(&self.sql)))?,
            ),
        };
        *self.kind.borrow_mut() = Some(fresh);
        self.active.set(false);
        *self.current_row.borrow_mut() = None;

        let bound = self.bound.borrow();
        let mut guard = self.kind.borrow_mut();
        let kind = guard.as_mut().expect("just assigned above");
        for (i, value) in bound.iter().enumerate() {
            if !value.is_null() {
                kind.raw_bind_parameter(i + 1, value)
                    .map_err(|e| Error::from_rusqlite(e, Some(&self.sql)))?;
            }
        }
        Ok(())
    }

    /// Cancel iteration; bindings are preserved (§4.3).
    pub fn reset(&self) -> Result<()> {
        self.reprepare()
    }

    /// Bind `value` at 1-based `index`. A successful bind on an active
    /// statement implicitly resets it (§4.3).
    pub fn bind(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        {
            let mut bound = self.bound.borrow_mut();
            if bound.len() < index {
                bound.resize(index, Value::Null);
            }
            bound[index - 1] = value.clone();
        }
        if self.active.get() {
            return self.reprepare();
        }
        let mut guard = self.kind.borrow_mut();
        let kind = guard.as_mut().ok_or_else(|| self.finalized_error())?;
        kind.raw_bind_parameter(index, value)
            .map_err(|e| Error::from_rusqlite(e, Some(&self.sql)))
    }

    /// Clear all bindings; implicitly resets if active (§4.3).
    pub fn clear_bindings(&self) -> Result<()> {
        self.bound.borrow_mut().clear();
        if self.active.get() {
            return self.reprepare();
        }
        let mut guard = self.kind.borrow_mut();
        let kind = guard.as_mut().ok_or_else(|| self.finalized_error())?;
        kind.clear_bindings();
        Ok(())
    }

    /// Bind a blob at 1-based `index`, running `destructor` once the buffer
    /// has been copied into the engine (§4.3, §9). Fails if a destructor is
    /// already registered for this exact buffer.
    pub fn bind_blob_with_destructor(
        &self,
        index: usize,
        data: &[u8],
        destructor: Box<dyn FnOnce() + Send>,
    ) -> Result<()> {
        let ptr = data.as_ptr() as usize;
        crate::blob::register(ptr, destructor)?;
        let result = self.bind(index, data);
        crate::blob::release(ptr);
        result
    }

    /// Clear all bindings, then bind `args` positionally starting at 1;
    /// missing trailing parameters remain null.
    pub fn bind_all(&self, args: &[Value]) -> Result<()> {
        self.clear_bindings()?;
        for (i, value) in args.iter().enumerate() {
            self.bind(i + 1, value.clone())?;
        }
        Ok(())
    }

    /// Transition an inactive prepared statement to active and fetch the
    /// first row.
    pub fn begin(&self) -> Result<bool> {
        self.advance()
    }

    /// Advance to the next row.
    pub fn next(&self) -> Result<bool> {
        self.advance()
    }

    fn advance(&self) -> Result<bool> {
        let outcome = {
            let mut guard = self.kind.borrow_mut();
            let kind = guard.as_mut().ok_or_else(|| self.finalized_error())?;
            self.step_with_retry(kind)
        };
        match outcome {
            Ok(Some(values)) => {
                self.active.set(true);
                *self.current_row.borrow_mut() = Some(values);
                Ok(true)
            }
            Ok(None) => {
                self.active.set(false);
                *self.current_row.borrow_mut() = None;
                Ok(false)
            }
            Err(e) => {
                self.active.set(false);
                *self.current_row.borrow_mut() = None;
                Err(e)
            }
        }
    }

    fn step_with_retry(&self, kind: &mut StatementKind<'sess>) -> Result<Option<Vec<Value>>> {
        let mut attempts = 0;
        loop {
            match kind.step_once() {
                StepOutcome::Row(values) => return Ok(Some(values)),
                StepOutcome::Done => return Ok(None),
                StepOutcome::Interrupt => return Err(Error::Interrupt),
                StepOutcome::Busy => return Err(Error::Busy),
                StepOutcome::Locked => {
                    attempts += 1;
                    if attempts > MAX_LOCK_RETRIES || !self.session.wait_for_unlock() {
                        return Err(Error::Busy);
                    }
                }
                StepOutcome::Error(e) => {
                    let message = match self.session.connection() {
                        Ok(conn) => enhance_constraint_error(conn, &e.to_string()),
                        Err(_) => e.to_string(),
                    };
                    return Err(Error::sql(message, Some(&self.sql)));
                }
            }
        }
    }

    /// Resets first, then releases the compiled handle. Idempotent.
    pub fn finalize(&self) {
        *self.kind.borrow_mut() = None;
        self.active.set(false);
        *self.current_row.borrow_mut() = None;
    }

    /// A cursor over the statement's current row, if any.
    pub fn row(&self) -> Row<'_, 'sess> {
        Row { stmt: self }
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// A non-owning cursor over a [`Statement`]'s current row (§3).
#[derive(Clone, Copy)]
pub struct Row<'stmt, 'sess> {
    stmt: &'stmt Statement<'sess>,
}

impl Row<'_, '_> {
    /// `empty` iff the referenced statement is unprepared or inactive.
    pub fn is_empty(&self) -> bool {
        self.stmt.current_row.borrow().is_none()
    }

    pub fn get(&self, column: usize) -> Value {
        self.stmt
            .current_row
            .borrow()
            .as_ref()
            .and_then(|row| row.get(column).cloned())
            .unwrap_or(Value::Null)
    }

    /// Linear scan by column name; see [`Row::col_no_throw`] for the
    /// non-panicking variant.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        (0..self.stmt.column_count()).find(|&i| self.stmt.column_name(i).as_deref() == Some(name))
    }

    /// Raises *invalid-argument* on a missed lookup (§4.3).
    pub fn col_no_throw(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| Error::sql(format!("no such column: {name}"), None))
    }

    /// Advance the underlying statement; all [`Row`] copies observe the new
    /// position (§3).
    pub fn advance(&self) -> Result<bool> {
        self.stmt.next()
    }
}

#[cfg(test)]
mod tests {
    use crate::session::Session;

    fn open_fixture() -> Session {
        let mut session = Session::new();
        session.open(":memory:").unwrap();
        session
            .exec(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)",
                &[],
            )
            .unwrap();
        session
            .exec("INSERT INTO t (name) VALUES ('a'), ('b'), ('c')", &[])
            .unwrap();
        session
    }

    #[test]
    fn iterates_all_rows_in_order() {
        let session = open_fixture();
        let stmt = session.exec("SELECT name FROM t ORDER BY id", &[]).unwrap();
        let mut names = Vec::new();
        loop {
            let row = stmt.row();
            if row.is_empty() {
                break;
            }
            names.push(row.get(0).as_str().unwrap().to_string());
            row.advance().unwrap();
        }
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn bind_round_trips_scalars() {
        let session = open_fixture();
        let stmt = session.exec("SELECT ?1", &[42i64.into()]).unwrap();
        assert_eq!(stmt.row().get(0).as_i64(), 42);
    }

    #[test]
    fn nan_round_trips_via_is_nan() {
        let session = open_fixture();
        let stmt = session.exec("SELECT ?1", &[f64::NAN.into()]).unwrap();
        assert!(stmt.row().get(0).as_f64().is_nan());
    }

    #[test]
    fn reset_preserves_bindings() {
        let session = open_fixture();
        let stmt = session.exec("SELECT ?1", &[7i64.into()]).unwrap();
        assert_eq!(stmt.row().get(0).as_i64(), 7);
        stmt.reset().unwrap();
        stmt.begin().unwrap();
        assert_eq!(stmt.row().get(0).as_i64(), 7);
    }

    #[test]
    fn exhausted_iteration_yields_empty_row() {
        let session = open_fixture();
        let stmt = session.exec("SELECT name FROM t", &[]).unwrap();
        while stmt.row().advance().unwrap() {}
        assert!(stmt.row().is_empty());
        assert!(!stmt.is_active());
    }

    #[test]
    fn finalize_is_idempotent() {
        let session = open_fixture();
        let stmt = session.exec("SELECT 1", &[]).unwrap();
        stmt.finalize();
        stmt.finalize();
        assert!(!stmt.is_prepared());
    }
}
