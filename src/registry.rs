//! Process-wide interning of SQL text.
//!
//! The registry is a singleton: the same SQL text always maps to the same
//! integer ID for the lifetime of the process, and the mapping never shrinks.
//! It never compiles anything — syntax errors only surface once a
//! [`crate::Session`] actually prepares the statement.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

struct Inner {
    by_text: HashMap<String, u32>,
    by_id: Vec<String>,
}

static REGISTRY: Lazy<Mutex<Inner>> = Lazy::new(|| {
    Mutex::new(Inner {
        by_text: HashMap::new(),
        by_id: Vec::new(),
    })
});

/// Intern `sql` and return its stable ID. Re-registering identical text
/// returns the same ID (invariant #2, §8).
pub fn register(sql: &str) -> u32 {
    let mut inner = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(&id) = inner.by_text.get(sql) {
        return id;
    }
    let id = inner.by_id.len() as u32;
    inner.by_id.push(sql.to_string());
    inner.by_text.insert(sql.to_string(), id);
    id
}

/// Number of distinct SQL texts interned so far.
pub fn count() -> usize {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner()).by_id.len()
}

/// Look up the SQL text for a previously registered ID.
///
/// # Errors
/// Returns [`Error::Sql`] if `id` was never registered.
pub fn text(id: u32) -> Result<String> {
    let inner = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    inner
        .by_id
        .get(id as usize)
        .cloned()
        .ok_or_else(|| Error::sql(format!("registry id {id} out of range"), None))
}
