//! In-memory sorted set of 64-bit integer IDs, exposed to SQL as a virtual
//! table (§7). The container lives here; the SQL bridge is
//! [`crate::idset::vtab`].
//!
//! Storage is an `Arc<Mutex<IdSetBody>>` so the same heap object can be
//! reached from ordinary Rust calls (`insert`, `erase`, ...) and from the
//! virtual-table cursor running inside the engine's own call stack (§7.3:
//! "a cursor observes whatever the backing container holds at each step, not
//! a point-in-time snapshot"). The set's SQL name is derived once, from the
//! body's stable heap address, and never changes for the life of the
//! `Arc` — matching §7.2's "the name is a property of the storage, not of
//! whichever session currently has it attached".

mod vtab;

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::session::Session;
use crate::statement::Statement;
use crate::value::Value;

#[derive(Debug, Default)]
pub(crate) struct IdSetBody {
    pub(crate) ids: Vec<i64>,
}

impl IdSetBody {
    fn insert_one(&mut self, id: i64) -> (usize, bool) {
        match self.ids.binary_search(&id) {
            Ok(pos) => (pos, false),
            Err(pos) => {
                self.ids.insert(pos, id);
                (pos, true)
            }
        }
    }

    fn erase_one(&mut self, id: i64) -> usize {
        match self.ids.binary_search(&id) {
            Ok(pos) => {
                self.ids.remove(pos);
                1
            }
            Err(_) => 0,
        }
    }
}

/// A sorted, duplicate-free set of `i64` IDs (§7.1). Cheap to construct;
/// expensive operations are the bulk ones, all `O(n)` or `O(n log n)`.
///
/// Carries the lifetime of whichever [`Session`] it is currently attached
/// to, so `attach`/`detach` can tell same-session re-attachment apart from a
/// move to a different session (§8, testable property #8) instead of only
/// tracking a bare attached/not-attached bit.
pub struct IdSet<'sess> {
    body: Arc<Mutex<IdSetBody>>,
    sql_name: String,
    attached: RefCell<Option<&'sess Session>>,
}

impl<'sess> Default for IdSet<'sess> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'sess> IdSet<'sess> {
    pub fn new() -> Self {
        let body = Arc::new(Mutex::new(IdSetBody::default()));
        let sql_name = derive_sql_name(&body);
        IdSet {
            body,
            sql_name,
            attached: RefCell::new(None),
        }
    }

    /// The stable name this set is known by in SQL once attached (§7.2).
    /// Derived from the backing storage's address, so it survives `attach`
    /// / `detach` / re-`attach` to a different session unchanged.
    pub fn sql_name(&self) -> &str {
        &self.sql_name
    }

    pub fn is_attached(&self) -> bool {
        self.attached.borrow().is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ids.is_empty()
    }

    pub fn reserve(&self, additional: usize) {
        self.lock().ids.reserve(additional);
    }

    pub fn shrink_to_fit(&self) {
        self.lock().ids.shrink_to_fit();
    }

    pub fn clear(&self) {
        self.lock().ids.clear();
    }

    pub fn contains(&self, id: i64) -> bool {
        self.lock().ids.binary_search(&id).is_ok()
    }

    pub fn to_vec(&self) -> Vec<i64> {
        self.lock().ids.clone()
    }

    /// Insert one id. Returns `true` if it was not already present
    /// (§7.1: "insertion of an existing id is a no-op that still reports
    /// success, but the returned count does not grow").
    pub fn insert(&self, id: i64) -> bool {
        self.lock().insert_one(id).1
    }

    /// Remove one id. Returns `true` if it had been present.
    pub fn erase(&self, id: i64) -> bool {
        self.lock().erase_one(id) == 1
    }

    /// Bulk-insert a half-open range `[start, end)`. Returns the number of
    /// ids actually added.
    pub fn insert_range(&self, start: i64, end: i64) -> usize {
        let mut body = self.lock();
        let mut added = 0;
        let mut id = start;
        while id < end {
            if body.insert_one(id).1 {
                added += 1;
            }
            id += 1;
        }
        added
    }

    /// Bulk-erase a half-open range `[start, end)`. Returns the number of
    /// ids actually removed.
    pub fn erase_range(&self, start: i64, end: i64) -> usize {
        let mut body = self.lock();
        let before = body.ids.len();
        body.ids.retain(|&id| id < start || id >= end);
        before - body.ids.len()
    }

    /// Insert every id currently held by `other`. Returns the number added.
    pub fn insert_set(&self, other: &IdSet<'_>) -> usize {
        let snapshot = other.to_vec();
        let mut body = self.lock();
        let mut added = 0;
        for id in snapshot {
            if body.insert_one(id).1 {
                added += 1;
            }
        }
        added
    }

    /// Erase every id currently held by `other`. Returns the number removed.
    pub fn erase_set(&self, other: &IdSet<'_>) -> usize {
        let remove: std::collections::HashSet<i64> = other.to_vec().into_iter().collect();
        let mut body = self.lock();
        let before = body.ids.len();
        body.ids.retain(|id| !remove.contains(id));
        before - body.ids.len()
    }

    /// Insert one id per row of `column` from an already-stepped statement
    /// (§7.1: "populate a set from a query's result column").
    pub fn insert_from_column(&self, stmt: &Statement<'_>, column: usize) -> Result<usize> {
        let mut added = 0;
        loop {
            let row = stmt.row();
            if row.is_empty() {
                break;
            }
            if self.insert(row.get(column).as_i64()) {
                added += 1;
            }
            if !stmt.next()? {
                break;
            }
        }
        Ok(added)
    }

    /// Run `sql` against `session` and insert one id per row of its first
    /// column.
    pub fn insert_from_sql(&self, session: &Session, sql: &str, args: &[Value]) -> Result<usize> {
        let stmt = session.exec(sql, args)?;
        self.insert_from_column(&stmt, 0)
    }

    /// Keep only ids also present in `other` (both assumed sorted ascending;
    /// `other`'s own invariant guarantees that). Returns the number removed.
    pub fn intersect(&self, other: &IdSet<'_>) -> usize {
        let keep: std::collections::HashSet<i64> = other.to_vec().into_iter().collect();
        let mut body = self.lock();
        let before = body.ids.len();
        body.ids.retain(|id| keep.contains(id));
        before - body.ids.len()
    }

    /// Replace this set's contents with the symmetric difference against
    /// `other`: ids in exactly one of the two sets. Returns the resulting
    /// size.
    pub fn symmetric_difference(&self, other: &IdSet<'_>) -> usize {
        let ours = self.to_vec();
        let theirs = other.to_vec();
        let mut result = Vec::with_capacity(ours.len() + theirs.len());
        let (mut i, mut j) = (0, 0);
        while i < ours.len() && j < theirs.len() {
            match ours[i].cmp(&theirs[j]) {
                std::cmp::Ordering::Less => {
                    result.push(ours[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    result.push(theirs[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        result.extend_from_slice(&ours[i..]);
        result.extend_from_slice(&theirs[j..]);
        let len = result.len();
        self.lock().ids = result;
        len
    }

    /// Exchange storage contents with `other` in place. The two sets keep
    /// their own SQL names and, if attached, their own virtual-table
    /// registrations — since the swap moves the *contents* behind each name
    /// rather than the names themselves, an attached table's rows change
    /// without any re-registration being necessary, on the same session or
    /// across two different ones (§7.2's "swap"; see DESIGN.md).
    pub fn swap(&self, other: &IdSet<'_>) {
        if std::ptr::eq(self, other) {
            return;
        }
        // Lock in a consistent address order so a concurrent `b.swap(a)`
        // can't deadlock against this call.
        if Arc::as_ptr(&self.body) < Arc::as_ptr(&other.body) {
            let (mut a, mut b) = (self.lock(), other.lock());
            std::mem::swap(&mut a.ids, &mut b.ids);
        } else {
            let (mut b, mut a) = (other.lock(), self.lock());
            std::mem::swap(&mut a.ids, &mut b.ids);
        }
    }

    /// Attach this set to `session` as a virtual table named [`Self::sql_name`]
    /// in the `temp` schema (§7.2, testable property #8). A no-op if already
    /// attached to this same session; if attached to a different session,
    /// detaches from it first so the old registration is never left behind.
    pub fn attach(&self, session: &'sess Session) -> Result<()> {
        {
            let current = self.attached.borrow();
            if let Some(existing) = *current {
                if std::ptr::eq(existing, session) {
                    return Ok(());
                }
            }
        }
        self.detach()?;
        vtab::attach(session, &self.sql_name, &self.body)?;
        *self.attached.borrow_mut() = Some(session);
        Ok(())
    }

    /// Drop the virtual-table registration. A no-op if not attached.
    pub fn detach(&self) -> Result<()> {
        let session = self.attached.borrow_mut().take();
        if let Some(session) = session {
            vtab::detach(session, &self.sql_name)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdSetBody> {
        self.body.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<'sess> PartialEq for IdSet<'sess> {
    fn eq(&self, other: &Self) -> bool {
        self.to_vec() == other.to_vec()
    }
}

impl<'sess> Eq for IdSet<'sess> {}

impl<'sess> PartialOrd for IdSet<'sess> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<'sess> Ord for IdSet<'sess> {
    /// Lexicographic order over the sorted id sequence; attachment state is
    /// never part of the comparison (§7.1).
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_vec().cmp(&other.to_vec())
    }
}

fn derive_sql_name(body: &Arc<Mutex<IdSetBody>>) -> String {
    let addr = Arc::as_ptr(body) as usize;
    format!("idset_{addr:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insert_reports_novelty() {
        let set = IdSet::new();
        assert!(set.insert(5));
        assert!(!set.insert(5));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn erase_reports_presence() {
        let set = IdSet::new();
        set.insert(7);
        assert!(set.erase(7));
        assert!(!set.erase(7));
        assert!(set.is_empty());
    }

    #[test]
    fn stays_sorted_after_mixed_inserts() {
        let set = IdSet::new();
        for id in [5, 1, 4, 2, 3] {
            set.insert(id);
        }
        assert_eq!(set.to_vec(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn insert_range_counts_only_new_ids() {
        let set = IdSet::new();
        set.insert(2);
        let added = set.insert_range(0, 5);
        assert_eq!(added, 4);
        assert_eq!(set.to_vec(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn intersect_keeps_common_ids_only() {
        let a = IdSet::new();
        a.insert_range(0, 10);
        let b = IdSet::new();
        for id in [2, 4, 6, 100] {
            b.insert(id);
        }
        a.intersect(&b);
        assert_eq!(a.to_vec(), vec![2, 4, 6]);
    }

    #[test]
    fn symmetric_difference_keeps_ids_in_exactly_one_set() {
        let a = IdSet::new();
        a.insert_range(0, 5);
        let b = IdSet::new();
        b.insert_range(3, 8);
        a.symmetric_difference(&b);
        assert_eq!(a.to_vec(), vec![0, 1, 2, 5, 6, 7]);
    }

    #[test]
    fn swap_exchanges_storage_but_not_names() {
        let a = IdSet::new();
        a.insert(1);
        let b = IdSet::new();
        b.insert(2);
        let (name_a, name_b) = (a.sql_name().to_string(), b.sql_name().to_string());
        a.swap(&b);
        assert_eq!(a.to_vec(), vec![2]);
        assert_eq!(b.to_vec(), vec![1]);
        assert_eq!(a.sql_name(), name_a);
        assert_eq!(b.sql_name(), name_b);
    }

    #[test]
    fn ordering_is_lexicographic_over_sorted_contents() {
        let a = IdSet::new();
        a.insert_range(0, 3);
        let b = IdSet::new();
        b.insert_range(0, 4);
        assert!(a < b);
        assert_eq!(a, a);
    }

    #[test]
    fn attach_and_detach_round_trip() {
        let mut session = Session::new();
        session.open(":memory:").unwrap();
        let set = IdSet::new();
        set.insert_range(1, 4);
        set.attach(&session).unwrap();
        assert!(set.is_attached());

        let stmt = session
            .exec(&format!("SELECT count(*) FROM temp.{}", set.sql_name()), &[])
            .unwrap();
        assert_eq!(stmt.row().get(0).as_i64(), 3);

        set.detach().unwrap();
        assert!(!set.is_attached());
    }

    #[test]
    fn reattaching_the_same_session_is_a_no_op() {
        let mut session = Session::new();
        session.open(":memory:").unwrap();
        let set = IdSet::new();
        set.attach(&session).unwrap();
        // A second attach to the identical session must not try to issue a
        // second CREATE VIRTUAL TABLE for a name that already exists.
        set.attach(&session).unwrap();
        assert!(set.is_attached());
    }

    #[test]
    fn attaching_elsewhere_detaches_from_the_prior_session_first() {
        let mut session_a = Session::new();
        session_a.open(":memory:").unwrap();
        let mut session_b = Session::new();
        session_b.open(":memory:").unwrap();

        let set = IdSet::new();
        set.attach(&session_a).unwrap();
        let name = set.sql_name().to_string();
        set.attach(&session_b).unwrap();
        assert!(set.is_attached());

        // session_a's registration is gone; session_b's is live.
        assert!(session_a
            .exec(&format!("SELECT 1 FROM temp.{name}"), &[])
            .is_err());
        assert!(session_b
            .exec(&format!("SELECT 1 FROM temp.{name}"), &[])
            .is_ok());
    }

    proptest! {
        /// Invariant #1 (§8): after any sequence of inserts/erases, the
        /// container is sorted ascending with no duplicates.
        #[test]
        fn stays_sorted_and_deduped_for_any_operation_sequence(
            ops in proptest::collection::vec((any::<bool>(), -50i64..50i64), 0..200),
        ) {
            let set = IdSet::new();
            for (do_insert, id) in ops {
                if do_insert {
                    set.insert(id);
                } else {
                    set.erase(id);
                }
            }
            let ids = set.to_vec();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(ids, sorted);
        }
    }
}
