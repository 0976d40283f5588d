//! Small helpers shared across modules: constraint-error message
//! enhancement. Poisoned-mutex recovery is handled inline at each lock site
//! with `unwrap_or_else(PoisonError::into_inner)` rather than through a
//! shared wrapper, since §7 requires the registry, blob-destructor map, and
//! unlock wait to never raise a user-visible error on poisoning, which rules
//! out a `Result`-returning lock helper for those call sites.

/// Quote a SQLite identifier, escaping embedded double quotes.
fn quote_identifier(id: &str) -> String {
    format!("\"{}\"", id.replace('"', "\"\""))
}

/// Enhance a `UNIQUE constraint failed` message with the name of the index
/// that was violated. SQLite's own message only names the table and
/// columns; this queries `PRAGMA index_list`/`PRAGMA index_info` to find the
/// matching unique index and appends its name, e.g.
///
/// `"UNIQUE constraint failed: users.email"` becomes
/// `"UNIQUE constraint failed: users.email (index: users_email_index)"`.
pub fn enhance_constraint_error(conn: &rusqlite::Connection, error_message: &str) -> String {
    try_enhance(conn, error_message).unwrap_or_else(|| error_message.to_string())
}

fn try_enhance(conn: &rusqlite::Connection, error_message: &str) -> Option<String> {
    let constraint_part = error_message
        .split("UNIQUE constraint failed:")
        .nth(1)?
        .trim()
        .trim_matches('`')
        .trim();

    let parts: Vec<&str> = constraint_part.split(',').collect();
    let first_part = parts.first()?.trim();
    let table_and_col: Vec<&str> = first_part.split('.').collect();
    if table_and_col.len() < 2 {
        return None;
    }
    let table_name = table_and_col[0].trim();
    let columns: Vec<String> = parts
        .iter()
        .map(|part| {
            part.trim()
                .split('.')
                .next_back()
                .unwrap_or_default()
                .to_string()
        })
        .collect();

    let pragma_query = format!("PRAGMA index_list({})", quote_identifier(table_name));
    let mut stmt = conn.prepare(&pragma_query).ok()?;
    let mut rows = stmt.query([]).ok()?;

    while let Some(row) = rows.next().ok()? {
        let index_name: String = row.get(1).ok()?;
        let is_unique: i64 = row.get(2).ok()?;
        if is_unique != 1 {
            continue;
        }

        let info_query = format!("PRAGMA index_info({})", quote_identifier(&index_name));
        let mut info_stmt = conn.prepare(&info_query).ok()?;
        let mut info_rows = info_stmt.query([]).ok()?;
        let mut index_columns = Vec::new();
        while let Some(info_row) = info_rows.next().ok()? {
            let col_name: String = info_row.get(2).ok()?;
            index_columns.push(col_name);
        }

        if index_columns == columns {
            return Some(format!(
                "{} (index: {})",
                error_message.trim_end_matches('`').trim_end(),
                index_name
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhances_unique_constraint_with_index_name() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
             CREATE UNIQUE INDEX users_email_index ON users(email);
             INSERT INTO users (email) VALUES ('a@example.com');",
        )
        .unwrap();

        let err = conn
            .execute(
                "INSERT INTO users (email) VALUES ('a@example.com')",
                [],
            )
            .unwrap_err();

        let enhanced = enhance_constraint_error(&conn, &err.to_string());
        assert!(enhanced.contains("users_email_index"), "{enhanced}");
    }

    #[test]
    fn leaves_unrelated_messages_untouched() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let msg = "some other error";
        assert_eq!(enhance_constraint_error(&conn, msg), msg);
    }
}
