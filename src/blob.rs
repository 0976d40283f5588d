//! Process-wide blob-destructor registry (§9 design note).
//!
//! The original design keys a map by the raw buffer pointer so a C-style
//! destructor callback — invoked with only the pointer — can find the rich
//! closure to run. `[u8]::as_ptr()` gives the same key without ever
//! dereferencing it, so the map survives the move to safe Rust unchanged;
//! what *does* change is when release happens. `rusqlite` always copies blob
//! parameters into the engine's own buffer (there is no safe binding API with
//! `SQLITE_STATIC`-style external-storage semantics), so the caller's buffer
//! is free to destroy the moment the bind call returns, and
//! [`Statement::bind_blob_with_destructor`](crate::statement::Statement) runs
//! the destructor synchronously rather than waiting for an engine callback.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

type Destructor = Box<dyn FnOnce() + Send>;

static DESTRUCTORS: Lazy<Mutex<HashMap<usize, Destructor>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register `destructor` for `ptr`. Fails if a destructor is already
/// registered for that pointer (§9: "on duplicate registration... fail with
/// Error").
pub fn register(ptr: usize, destructor: Destructor) -> Result<()> {
    let mut map = DESTRUCTORS.lock().unwrap_or_else(|e| e.into_inner());
    if map.contains_key(&ptr) {
        return Err(Error::sql(
            format!("destructor already registered for buffer {ptr:#x}"),
            None,
        ));
    }
    map.insert(ptr, destructor);
    Ok(())
}

/// Look up and invoke the destructor for `ptr`, then remove it. A no-op if
/// none is registered.
pub fn release(ptr: usize) {
    let destructor = DESTRUCTORS.lock().unwrap_or_else(|e| e.into_inner()).remove(&ptr);
    if let Some(destructor) = destructor {
        destructor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn release_invokes_destructor_exactly_once() {
        let data = vec![1u8, 2, 3];
        let ptr = data.as_ptr() as usize;
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        register(ptr, Box::new(move || ran2.store(true, Ordering::SeqCst))).unwrap();
        release(ptr);
        assert!(ran.load(Ordering::SeqCst));
        // Releasing again is a no-op, not a second invocation.
        release(ptr);
    }

    #[test]
    fn duplicate_registration_for_same_pointer_fails() {
        let data = vec![4u8];
        let ptr = data.as_ptr() as usize;
        register(ptr, Box::new(|| {})).unwrap();
        assert!(register(ptr, Box::new(|| {})).is_err());
        release(ptr);
    }
}
