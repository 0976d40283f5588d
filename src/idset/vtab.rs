//! SQL bridge for [`super::IdSet`] (§7.3, §7.4): a virtual-table module
//! named `sdig_idset`, one instance per attached set, backed by the same
//! `Arc<Mutex<IdSetBody>>` the Rust-side [`super::IdSet`] handle holds.
//!
//! `rusqlite`'s virtual-table traits (`VTab`, `CreateVTab`, `UpdateVTab`,
//! `VTabCursor`) are `unsafe trait`s because the engine invokes their
//! methods across an FFI boundary it owns, not because anything in this
//! file dereferences a raw pointer itself. The `#[allow(unsafe_code)]`
//! below is scoped to this module alone; the crate-wide `unsafe_code =
//! "deny"` lint still applies everywhere else. The one exception is
//! [`IdSetTab::conflict_mode`], which does call into raw FFI
//! (`sqlite3_vtab_on_conflict`) since `rusqlite`'s safe `vtab` API has no
//! wrapper for it and REPLACE handling genuinely needs it (§4.6).
//!
//! A single `CREATE VIRTUAL TABLE ... USING sdig_idset(...)` module
//! registration is shared by every attached set on a connection (rusqlite's
//! `Aux` data is per-module, not per-table), so the constructor argument
//! passed in `USING sdig_idset('<token>')` carries a lookup key into the
//! process-wide [`BODIES`] map instead; see [`super::IdSet::sql_name`] for
//! where that token comes from.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rusqlite::ffi;
use rusqlite::types::{Type, ValueRef};
use rusqlite::vtab::{
    Context, CreateVTab, IndexConstraintOp, IndexInfo, UpdateVTab, VTab, VTabConnection, VTabCursor, VTabKind, Values,
};
use rusqlite::Error as SqliteError;

use crate::error::{Error, Result};
use crate::idset::IdSetBody;
use crate::session::Session;

static BODIES: Lazy<Mutex<HashMap<String, Arc<Mutex<IdSetBody>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_bodies() -> std::sync::MutexGuard<'static, HashMap<String, Arc<Mutex<IdSetBody>>>> {
    BODIES.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(super) fn attach(session: &Session, name: &str, body: &Arc<Mutex<IdSetBody>>) -> Result<()> {
    let conn = session.connection()?;
    register_module(conn);
    lock_bodies().insert(name.to_string(), body.clone());
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE temp.{name} USING sdig_idset('{name}')"
    ))
    .map_err(|e| {
        lock_bodies().remove(name);
        Error::from_rusqlite(e, None)
    })
}

pub(super) fn detach(session: &Session, name: &str) -> Result<()> {
    let conn = session.connection()?;
    conn.execute_batch(&format!("DROP TABLE temp.{name}"))
        .map_err(|e| Error::from_rusqlite(e, None))?;
    lock_bodies().remove(name);
    Ok(())
}

/// Registering the same module name twice on one connection is harmless
/// (the second registration simply replaces the first with an identical
/// definition), so failures here are swallowed rather than surfaced.
fn register_module(conn: &rusqlite::Connection) {
    let _ = conn.create_module::<IdSetTab>("sdig_idset", rusqlite::vtab::update_module(), None);
}

/// Build a genuine `SQLITE_CONSTRAINT`-class error (as opposed to a generic
/// `SQLITE_ERROR`) so the engine's own ON CONFLICT machinery can act on it:
/// in particular, a statement run under `OR IGNORE` silently swallows an
/// `SQLITE_CONSTRAINT` failure returned from a virtual table's `xUpdate`
/// without ever surfacing it to the caller, which is exactly the "IGNORE →
/// no-op" behaviour §4.6 describes. REPLACE cannot be resolved this way —
/// the engine has no idea which row to delete — so it is still handled
/// explicitly below via [`IdSetTab::conflict_mode`].
fn constraint_error(extended_code: c_int, message: String) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(ffi::Error::new(extended_code), Some(message))
}

#[repr(C)]
struct IdSetTab {
    base: rusqlite::vtab::sqlite3_vtab,
    body: Arc<Mutex<IdSetBody>>,
    db: *mut ffi::sqlite3,
}

impl IdSetTab {
    /// The ON CONFLICT resolution algorithm the engine is currently applying
    /// to the statement driving this `xUpdate` call (ROLLBACK/IGNORE/FAIL/
    /// ABORT/REPLACE). `rusqlite` doesn't expose `sqlite3_vtab_on_conflict`
    /// in its safe API, so this reaches past it; the returned code is one of
    /// the plain `SQLITE_{ROLLBACK,IGNORE,FAIL,ABORT,REPLACE}` constants.
    fn conflict_mode(&self) -> c_int {
        unsafe { ffi::sqlite3_vtab_on_conflict(self.db) }
    }
}

unsafe impl<'vtab> VTab<'vtab> for IdSetTab {
    type Aux = ();
    type Cursor = IdSetCursor;

    fn connect(
        db: &mut VTabConnection,
        _aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let token = args
            .get(3)
            .map(|raw| {
                String::from_utf8_lossy(raw)
                    .trim()
                    .trim_matches(|c| c == '\'' || c == '"')
                    .to_string()
            })
            .unwrap_or_default();
        let body = lock_bodies()
            .get(&token)
            .cloned()
            .ok_or_else(|| SqliteError::ModuleError(format!("unknown idset token: {token}")))?;
        let raw_db = unsafe { db.as_ptr() };
        Ok((
            "CREATE TABLE x(id INTEGER PRIMARY KEY)".to_owned(),
            IdSetTab {
                base: rusqlite::vtab::sqlite3_vtab::default(),
                body,
                db: raw_db,
            },
        ))
    }

    /// Forward `=`, `<`, `<=`, `>`, `>=` constraints on the `id` column to the
    /// cursor as an index string (one operator character per accepted
    /// argv slot, in argv order), and mark an ascending `ORDER BY id` as
    /// already satisfied by the cursor's natural walk order (§4.6).
    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        // Collect which constraints to accept while only holding an
        // immutable borrow of `info`, then apply the mutable
        // `constraint_usage` calls in a second pass.
        let mut accepted: Vec<(usize, char)> = Vec::new();
        for (i, constraint) in info.constraints().into_iter().enumerate() {
            if !constraint.usable() || constraint.column() != 0 {
                continue;
            }
            let op_char = match constraint.operator() {
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => '=',
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LT => '<',
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LE => 'l',
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT => '>',
                IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GE => 'g',
                _ => continue,
            };
            accepted.push((i, op_char));
        }

        let mut idx_str = String::new();
        for (argv_index, (constraint_idx, op_char)) in accepted.into_iter().enumerate() {
            info.constraint_usage(constraint_idx)
                .set_argv_index((argv_index + 1) as c_int);
            idx_str.push(op_char);
        }
        info.set_idx_str(&idx_str);

        let mut order_bys = info.order_bys().into_iter();
        let ascending_by_id_or_unordered = match order_bys.next() {
            None => true,
            Some(first) => order_bys.next().is_none() && first.column() == 0 && !first.is_order_by_desc(),
        };
        if ascending_by_id_or_unordered {
            info.set_order_by_consumed(true);
        }

        let len = self.body.lock().unwrap_or_else(std::sync::PoisonError::into_inner).ids.len();
        info.set_estimated_cost(len.max(1) as f64);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<Self::Cursor> {
        Ok(IdSetCursor::new(self.body.clone()))
    }
}

unsafe impl<'vtab> CreateVTab<'vtab> for IdSetTab {
    const KIND: VTabKind = VTabKind::Default;
}

struct IdSetCursor {
    body: Arc<Mutex<IdSetBody>>,
    lower_bound: i64,
    upper_bound: i64,
    current: Option<i64>,
    eof: bool,
}

impl IdSetCursor {
    fn new(body: Arc<Mutex<IdSetBody>>) -> Self {
        let mut cursor = IdSetCursor {
            body,
            lower_bound: i64::MIN,
            upper_bound: i64::MAX,
            current: None,
            eof: false,
        };
        cursor.resync();
        cursor
    }

    /// Re-derive position from the backing container's *current* contents
    /// rather than a frozen index (§7.3: a cursor must not repeat or skip
    /// an id that survives a concurrent mutation). Each call finds the
    /// smallest id still present at or above `lower_bound`, stopping at
    /// `upper_bound` when a range constraint was pushed down.
    fn resync(&mut self) {
        let guard = self.body.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.ids.iter().find(|&&id| id >= self.lower_bound) {
            Some(&id) if id <= self.upper_bound => {
                self.current = Some(id);
                self.eof = false;
            }
            _ => {
                self.current = None;
                self.eof = true;
            }
        }
    }
}

unsafe impl VTabCursor for IdSetCursor {
    /// `idx_str` carries one operator character per bound `best_index`
    /// accepted, in the same order as the argv values in `args`; unknown or
    /// absent index strings fall back to a full ascending scan.
    fn filter(&mut self, _idx_num: c_int, idx_str: Option<&str>, args: &Values<'_>) -> rusqlite::Result<()> {
        self.lower_bound = i64::MIN;
        self.upper_bound = i64::MAX;
        if let Some(idx_str) = idx_str {
            let mut values = args.iter();
            for op in idx_str.chars() {
                let Some(value) = values.next() else {
                    break;
                };
                let bound = value.as_i64()?;
                match op {
                    '=' => {
                        self.lower_bound = self.lower_bound.max(bound);
                        self.upper_bound = self.upper_bound.min(bound);
                    }
                    '<' => self.upper_bound = self.upper_bound.min(bound.saturating_sub(1)),
                    'l' => self.upper_bound = self.upper_bound.min(bound),
                    '>' => self.lower_bound = self.lower_bound.max(bound.saturating_add(1)),
                    'g' => self.lower_bound = self.lower_bound.max(bound),
                    _ => {}
                }
            }
        }
        self.resync();
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        if let Some(id) = self.current {
            self.lower_bound = id.saturating_add(1);
        }
        self.resync();
        Ok(())
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn column(&self, ctx: &mut Context, _i: c_int) -> rusqlite::Result<()> {
        ctx.set_result(&self.current.unwrap_or_default())
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.current.unwrap_or_default())
    }
}

unsafe impl<'vtab> UpdateVTab<'vtab> for IdSetTab {
    /// `DELETE FROM <set> WHERE ...` (§7.4).
    fn delete(&mut self, rowid: ValueRef<'_>) -> rusqlite::Result<()> {
        let id = rowid.as_i64()?;
        self.body.lock().unwrap_or_else(std::sync::PoisonError::into_inner).erase_one(id);
        Ok(())
    }

    /// `INSERT INTO <set> (id) VALUES (...)`. The id column is declared
    /// `INTEGER PRIMARY KEY`, so SQLite passes the new rowid twice: once as
    /// the conventional "new rowid" argument and once as the value bound to
    /// the `id` column itself; both must agree (§7.4: "the rowid and the id
    /// are the same value, by construction"). On a duplicate id, REPLACE is
    /// handled here directly (inserting an id that's already present is a
    /// no-op, so REPLACE just succeeds); every other conflict mode raises a
    /// genuine `SQLITE_CONSTRAINT_UNIQUE`, which the engine itself swallows
    /// under IGNORE and propagates otherwise.
    fn insert(&mut self, args: &Values<'_>) -> rusqlite::Result<i64> {
        let mut values = args.iter();
        let _old_rowid_placeholder = values.next();
        let new_rowid = values.next();
        let id_value = values
            .next()
            .ok_or_else(|| SqliteError::ModuleError("missing id value".to_owned()))?;
        if id_value.data_type() == Type::Null {
            return Err(constraint_error(
                ffi::SQLITE_CONSTRAINT_NOTNULL,
                "NOT NULL constraint failed: id".to_owned(),
            ));
        }
        let id = id_value.as_i64()?;
        if let Some(rowid) = new_rowid {
            if rowid.data_type() != Type::Null && rowid.as_i64()? != id {
                return Err(constraint_error(
                    ffi::SQLITE_CONSTRAINT_VTAB,
                    "rowid must equal id for this table".to_owned(),
                ));
            }
        }
        let mut body = self.body.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let (_, inserted) = body.insert_one(id);
        if !inserted {
            if self.conflict_mode() == ffi::SQLITE_REPLACE {
                return Ok(id);
            }
            return Err(constraint_error(
                ffi::SQLITE_CONSTRAINT_UNIQUE,
                format!("UNIQUE constraint failed: id {id}"),
            ));
        }
        Ok(id)
    }

    /// `UPDATE <set> SET id = ...`. Renaming an id to one already present is
    /// a conflict; renaming to itself is a no-op. REPLACE removes the row
    /// being updated (the pre-existing row with the target id wins); every
    /// other conflict mode raises `SQLITE_CONSTRAINT_UNIQUE`.
    fn update(&mut self, args: &Values<'_>) -> rusqlite::Result<()> {
        let mut values = args.iter();
        let old_rowid = values
            .next()
            .ok_or_else(|| SqliteError::ModuleError("missing old rowid".to_owned()))?
            .as_i64()?;
        let new_rowid = values.next();
        let new_id_value = values
            .next()
            .ok_or_else(|| SqliteError::ModuleError("missing id value".to_owned()))?;
        if new_id_value.data_type() == Type::Null {
            return Err(constraint_error(
                ffi::SQLITE_CONSTRAINT_NOTNULL,
                "NOT NULL constraint failed: id".to_owned(),
            ));
        }
        let new_id = new_id_value.as_i64()?;
        if let Some(rowid) = new_rowid {
            if rowid.data_type() != Type::Null && rowid.as_i64()? != new_id {
                return Err(constraint_error(
                    ffi::SQLITE_CONSTRAINT_VTAB,
                    "rowid must equal id for this table".to_owned(),
                ));
            }
        }
        if new_id == old_rowid {
            return Ok(());
        }
        let mut body = self.body.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if body.ids.binary_search(&new_id).is_ok() {
            if self.conflict_mode() == ffi::SQLITE_REPLACE {
                body.erase_one(old_rowid);
                return Ok(());
            }
            return Err(constraint_error(
                ffi::SQLITE_CONSTRAINT_UNIQUE,
                format!("UNIQUE constraint failed: id {new_id}"),
            ));
        }
        body.erase_one(old_rowid);
        body.insert_one(new_id);
        Ok(())
    }
}
