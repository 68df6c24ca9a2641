/// Typed access to the underlying SQLite connection.
///
/// One connection, one writer: every caller goes through the mutex, which
/// serializes readers and writers alike. The verb helpers (`execute`,
/// `insert`, `query_rows`, `query_opt`) centralize parameter binding and
/// error mapping; they take any `&Connection`, so the same functions serve
/// both one-off statements and work inside a transaction closure.
/// Transactions commit on success and roll back when the closure returns an
/// error, including [`SatchelError::Cancelled`] from a cooperative
/// cancellation check.
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Params, Row, Transaction, TransactionBehavior,
};

use satchel_core::error::{Result, SatchelError};

use crate::schema;

pub(crate) fn storage_err(e: rusqlite::Error) -> SatchelError {
    SatchelError::Storage(e.to_string())
}

/// Run a statement, returning the number of rows affected.
pub fn execute(conn: &Connection, sql: &str, params: impl Params) -> Result<usize> {
    conn.execute(sql, params).map_err(storage_err)
}

/// Run an INSERT, returning the new rowid.
pub fn insert(conn: &Connection, sql: &str, params: impl Params) -> Result<i64> {
    conn.execute(sql, params).map_err(storage_err)?;
    Ok(conn.last_insert_rowid())
}

/// Run a query, mapping every row through `map`.
pub fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    params: impl Params,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let rows = stmt.query_map(params, map).map_err(storage_err)?;
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(storage_err)
}

/// Run a query expected to produce at most one row.
pub fn query_opt<T>(
    conn: &Connection,
    sql: &str,
    params: impl Params,
    map: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Option<T>> {
    conn.query_row(sql, params, map)
        .optional()
        .map_err(storage_err)
}

pub struct SqlAdapter {
    conn: Mutex<Connection>,
}

impl SqlAdapter {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags).map_err(storage_err)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database. Used by tests and throwaway
    /// stores; the schema is created fresh.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // journal_mode reports the resulting mode as a row; in-memory
        // databases stay on "memory"
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(storage_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(storage_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage_err)?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run one statement outside an explicit transaction.
    pub fn execute(&self, sql: &str, params: impl Params) -> Result<usize> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        execute(&conn, sql, params)
    }

    /// Run one INSERT outside an explicit transaction, returning the rowid.
    pub fn insert(&self, sql: &str, params: impl Params) -> Result<i64> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        insert(&conn, sql, params)
    }

    /// Run one query outside an explicit transaction.
    pub fn query_rows<T>(
        &self,
        sql: &str,
        params: impl Params,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        query_rows(&conn, sql, params, map)
    }

    /// Run read-only statements outside an explicit transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction. Commit on `Ok`, roll back
    /// on any error.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("sqlite lock poisoned");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(storage_err)?;
        Ok(out)
    }
}

impl std::fmt::Debug for SqlAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SqlAdapter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_execute_insert_and_query() {
        let adapter = SqlAdapter::open_in_memory().unwrap();
        let rowid = adapter
            .insert(
                "INSERT INTO docs (docid) VALUES (?1)",
                rusqlite::params!["doc-a"],
            )
            .unwrap();
        assert_eq!(rowid, 1);

        let affected = adapter
            .execute(
                "UPDATE info SET value = ?1 WHERE key = 'local_seq'",
                rusqlite::params!["5"],
            )
            .unwrap();
        assert_eq!(affected, 1);

        let ids = adapter
            .query_rows("SELECT docid FROM docs ORDER BY docid", [], |row| {
                row.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(ids, vec!["doc-a"]);
    }

    #[test]
    fn transaction_commits_on_ok() {
        let adapter = SqlAdapter::open_in_memory().unwrap();
        adapter
            .transaction(|tx| {
                execute(
                    tx,
                    "INSERT INTO local_docs (id, json) VALUES ('a', '{}')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let count = adapter
            .read(|conn| {
                query_opt(conn, "SELECT COUNT(*) FROM local_docs", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .unwrap();
        assert_eq!(count, Some(1));
    }

    #[test]
    fn transaction_rolls_back_on_err() {
        let adapter = SqlAdapter::open_in_memory().unwrap();
        let result: Result<()> = adapter.transaction(|tx| {
            execute(
                tx,
                "INSERT INTO local_docs (id, json) VALUES ('a', '{}')",
                [],
            )?;
            Err(SatchelError::Cancelled)
        });
        assert!(matches!(result, Err(SatchelError::Cancelled)));

        let count = adapter
            .read(|conn| {
                query_opt(conn, "SELECT COUNT(*) FROM local_docs", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .unwrap();
        assert_eq!(count, Some(0));
    }

    #[test]
    fn constraint_violation_is_storage_error() {
        let adapter = SqlAdapter::open_in_memory().unwrap();
        let result = adapter.execute(
            "INSERT INTO info (key, value) VALUES ('local_seq', '9')",
            [],
        );
        assert!(matches!(result, Err(SatchelError::Storage(_))));
    }
}
