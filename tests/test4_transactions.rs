use sqlite_dispatch::{Connection, DispatchError, TransactionKind, TransactionScope, params};

fn seeded_connection() -> Connection {
    let conn = Connection::new(":memory:");
    conn.open().unwrap();
    conn.execute_batch("CREATE TABLE t (v TEXT)").unwrap();
    conn
}

fn row_count(conn: &Connection) -> i64 {
    let mut cursor = conn
        .execute_query("SELECT COUNT(*) FROM t", params![])
        .unwrap();
    assert!(cursor.advance().unwrap());
    cursor.i64_at(0).unwrap()
}

#[test]
fn a_committed_scope_keeps_its_writes() {
    let conn = seeded_connection();
    let mut scope = TransactionScope::begin(&conn, TransactionKind::Exclusive).unwrap();
    conn.execute_update("INSERT INTO t VALUES ('kept')", params![])
        .unwrap();
    scope.commit().unwrap();
    drop(scope);
    assert!(!conn.is_in_transaction());
    assert_eq!(row_count(&conn), 1);
}

#[test]
fn a_rolled_back_scope_discards_its_writes() {
    let conn = seeded_connection();
    let mut scope = TransactionScope::begin(&conn, TransactionKind::Deferred).unwrap();
    conn.execute_update("INSERT INTO t VALUES ('dropped')", params![])
        .unwrap();
    scope.rollback().unwrap();
    drop(scope);
    assert!(!conn.is_in_transaction());
    assert_eq!(row_count(&conn), 0);
}

#[test]
fn completing_a_scope_twice_is_misuse() {
    let conn = seeded_connection();
    let mut scope = TransactionScope::begin(&conn, TransactionKind::Exclusive).unwrap();
    assert!(!scope.is_complete());
    scope.commit().unwrap();
    assert!(scope.is_complete());
    assert!(matches!(scope.commit(), Err(DispatchError::Misuse(_))));
    assert!(matches!(scope.rollback(), Err(DispatchError::Misuse(_))));
}

#[test]
fn dropping_an_incomplete_scope_rolls_back() {
    let conn = seeded_connection();
    {
        let _scope = TransactionScope::begin(&conn, TransactionKind::Exclusive).unwrap();
        conn.execute_update("INSERT INTO t VALUES ('dropped')", params![])
            .unwrap();
    }
    assert!(!conn.is_in_transaction());
    assert_eq!(row_count(&conn), 0);
}

#[test]
fn transaction_scopes_do_not_nest() {
    let conn = seeded_connection();
    let _outer = TransactionScope::begin(&conn, TransactionKind::Exclusive).unwrap();
    let inner = TransactionScope::begin(&conn, TransactionKind::Exclusive);
    assert!(matches!(inner, Err(DispatchError::Misuse(_))));
}

#[test]
fn savepoint_scopes_nest_inside_a_transaction() {
    let conn = seeded_connection();
    let mut outer = TransactionScope::begin(&conn, TransactionKind::Exclusive).unwrap();
    conn.execute_update("INSERT INTO t VALUES ('x')", params![])
        .unwrap();

    let mut inner = TransactionScope::savepoint(&conn, "inner").unwrap();
    conn.execute_update("INSERT INTO t VALUES ('y')", params![])
        .unwrap();
    inner.rollback().unwrap();

    outer.commit().unwrap();
    drop(outer);

    let mut cursor = conn.execute_query("SELECT v FROM t", params![]).unwrap();
    assert!(cursor.advance().unwrap());
    assert_eq!(cursor.string_at(0).unwrap(), Some("x".to_owned()));
    assert!(!cursor.advance().unwrap());
}

#[test]
fn a_released_savepoint_scope_keeps_its_writes() {
    let conn = seeded_connection();
    let mut scope = TransactionScope::savepoint(&conn, "sp").unwrap();
    conn.execute_update("INSERT INTO t VALUES ('kept')", params![])
        .unwrap();
    scope.commit().unwrap();
    assert_eq!(row_count(&conn), 1);
}
