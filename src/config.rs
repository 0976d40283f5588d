//! Connection configuration: URI scheme dispatch and library-wide defaults.
//!
//! Schemes, once dispatched, are rewritten into the `file:` URI form the
//! engine expects; everything else about the path (including the special
//! `:memory:` form) is the engine's business.

use crate::error::Error;

/// Number of virtual-machine steps between progress-handler invocations.
pub const PROGRESS_STEP_INTERVAL: i32 = 10_000;

/// Busy timeout applied to every newly opened [`crate::Session`].
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Resolve a `[scheme:]path-or-uri` into the engine-facing URI string.
///
/// Recognized schemes are `sqlite3` and `file`, case-insensitively. Absent a
/// scheme, the path is wrapped as `file://<as-given>`. Any other scheme is
/// rejected.
pub fn resolve_uri(uri: &str) -> Result<String, Error> {
    match uri.split_once(':') {
        Some((scheme, rest)) if is_recognized_scheme(scheme) => Ok(format!("file:{rest}")),
        Some((scheme, _)) if looks_like_scheme(scheme) => {
            Err(Error::sql("unrecognised database type", Some(uri)))
        }
        _ => Ok(format!("file://{uri}")),
    }
}

fn is_recognized_scheme(scheme: &str) -> bool {
    scheme.eq_ignore_ascii_case("sqlite3") || scheme.eq_ignore_ascii_case("file")
}

/// A `scheme:` prefix is only a scheme if it looks like one — bare Windows
/// drive letters (`C:\path`) and similar must not be misread as a scheme.
fn looks_like_scheme(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.chars().all(|c| c.is_ascii_alphabetic())
        && candidate.len() > 1
}
