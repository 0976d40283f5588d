//! The literal end-to-end scenarios from the testable-properties section:
//! precompiled lookup, cross-session busy retry, rollback hook ordering,
//! IDSet bulk insert plus SQL visibility, virtual-table NOT NULL/IGNORE, and
//! cursor survival across a concurrent erase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use sdig::{registry, IdSet, Session, Transaction, Value};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_memory() -> Session {
    init_logging();
    let mut session = Session::new();
    session.open(":memory:").unwrap();
    session
}

#[test]
fn s1_precompiled_lookup_with_bind() {
    let session = open_memory();
    session
        .exec(
            "CREATE TABLE offices (city TEXT, phone TEXT)",
            &[],
        )
        .unwrap();
    session
        .exec(
            "INSERT INTO offices (city, phone) VALUES ('London', '+44 20 7877 2041'), ('Paris', '+33 1 00 00 00 00')",
            &[],
        )
        .unwrap();

    let id = registry::register("SELECT phone FROM offices WHERE city = 'London'");
    let stmt = session.exec_id(id, &[]).unwrap();
    assert!(!stmt.row().is_empty());
    assert_eq!(stmt.row().get(0).as_str(), Some("+44 20 7877 2041"));
    assert!(!stmt.next().unwrap(), "exactly one row expected");
}

#[test]
fn s2_cross_session_busy_retry() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.db");

    {
        // Set up the schema up front so both sessions see it.
        let mut setup = Session::new();
        setup.open(path.to_str().unwrap()).unwrap();
        setup
            .exec(
                "CREATE TABLE employees (id INTEGER PRIMARY KEY, name TEXT)",
                &[],
            )
            .unwrap();
    }

    let (lock_held_tx, lock_held_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let path_a = path.clone();

    let handle_a = thread::spawn(move || {
        let mut session = Session::new();
        session.open(path_a.to_str().unwrap()).unwrap();
        Transaction::begin(&session, |_txn| {
            session.exec("INSERT INTO employees (name) VALUES ('alice')", &[])?;
            lock_held_tx.send(()).ok();
            // Hold the write lock until the controller below releases it.
            release_rx.recv_timeout(Duration::from_secs(5)).ok();
            Ok(())
        })
        .unwrap();
    });

    lock_held_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Short enough that B's first attempt genuinely times out (returns
    // Busy) instead of blocking until A releases mid-wait and silently
    // succeeding on "attempt 1".
    let busy_timeout = Duration::from_millis(60);
    let mut session_b = Session::new();
    session_b.open(path.to_str().unwrap()).unwrap();
    session_b.busy_timeout(busy_timeout).unwrap();

    let attempts = std::cell::RefCell::new(0);
    let release_scheduled = AtomicBool::new(false);

    let result = Transaction::begin(&session_b, |_txn| {
        let attempt = {
            let mut count = attempts.borrow_mut();
            *count += 1;
            *count
        };
        if attempt == 1 && !release_scheduled.swap(true, Ordering::SeqCst) {
            // Release A only after this attempt has had time to actually
            // exhaust its busy_timeout, so it fails with Busy rather than
            // unblocking mid-wait and succeeding on the first try.
            let release_tx = release_tx.clone();
            thread::spawn(move || {
                thread::sleep(busy_timeout + Duration::from_millis(60));
                release_tx.send(()).ok();
            });
        }
        session_b.exec("INSERT INTO employees (name) VALUES ('bob')", &[])?;
        Ok(())
    });

    handle_a.join().unwrap();
    result.unwrap();

    assert_eq!(*attempts.borrow(), 2, "expected exactly one retry (retry_count == 1)");
    let count = session_b.exec("SELECT count(*) FROM employees", &[]).unwrap();
    assert_eq!(count.row().get(0).as_i64(), 2);
}

#[test]
fn s3_rollback_hooks_run_lifo() {
    let session = open_memory();
    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

    let result: sdig::Result<()> = Transaction::begin(&session, |_txn| {
        for label in ["H1", "H2", "H3"] {
            let order = order.clone();
            session.on_rollback(move || order.borrow_mut().push(label));
        }
        let order = order.clone();
        session.on_final_commit(move || order.borrow_mut().push("COMMIT-HOOK"));
        Err(sdig::Error::sql("force rollback", None))
    });
    assert!(result.is_err());
    assert_eq!(*order.borrow(), vec!["H3", "H2", "H1"]);
}

#[test]
fn s4_idset_intermixed_insert_visible_in_sql() {
    let session = open_memory();
    let set = IdSet::new();
    for id in [2, 4, 6, 8] {
        set.insert(id);
    }
    set.attach(&session).unwrap();

    let added = set.insert_range(0, 11);
    // insert_range adds every id in [0, 11) not already present: 0,1,3,5,7,9,10 = 7
    assert_eq!(added, 7);
    assert_eq!(
        set.to_vec(),
        vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
    );

    let stmt = session
        .exec(
            &format!("SELECT id FROM temp.{} ORDER BY id", set.sql_name()),
            &[],
        )
        .unwrap();
    let mut ids = Vec::new();
    let mut row = stmt.row();
    while !row.is_empty() {
        ids.push(row.get(0).as_i64());
        if !row.advance().unwrap() {
            break;
        }
        row = stmt.row();
    }
    assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
}

#[test]
fn s5_virtual_table_insert_not_null_and_or_ignore() {
    let session = open_memory();
    let set = IdSet::new();
    set.insert(1);
    set.attach(&session).unwrap();
    let table = format!("temp.{}", set.sql_name());

    let err = session.exec(&format!("INSERT INTO {table} (id) VALUES (NULL)"), &[]);
    assert!(err.is_err());

    session
        .exec(&format!("INSERT OR IGNORE INTO {table} (id) VALUES (NULL)"), &[])
        .unwrap();
    assert_eq!(set.to_vec(), vec![1]);
}

#[test]
fn s6_cursor_survives_concurrent_erase() {
    let session = open_memory();
    let set = IdSet::new();
    for id in 1..=5 {
        set.insert(id);
    }
    set.attach(&session).unwrap();

    let stmt = session
        .exec(
            &format!("SELECT id FROM temp.{} ORDER BY id", set.sql_name()),
            &[],
        )
        .unwrap();

    assert_eq!(stmt.row().get(0).as_i64(), 1);
    assert!(stmt.next().unwrap());
    assert_eq!(stmt.row().get(0).as_i64(), 2);

    set.erase(3);

    assert!(stmt.next().unwrap());
    assert_eq!(stmt.row().get(0).as_i64(), 4);
    assert!(stmt.next().unwrap());
    assert_eq!(stmt.row().get(0).as_i64(), 5);
    assert!(!stmt.next().unwrap());
}
