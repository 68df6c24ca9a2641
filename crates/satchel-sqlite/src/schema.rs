/// Schema DDL and the linear migration counter.
///
/// The version lives in SQLite's `user_version` pragma. Migrations only run
/// forward; opening a database written by a newer library version fails.
use rusqlite::Connection;

use satchel_core::error::{Result, SatchelError};

use crate::adapter::storage_err;

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE docs (
    doc_id INTEGER PRIMARY KEY,
    docid TEXT UNIQUE NOT NULL
);

CREATE TABLE revs (
    sequence INTEGER PRIMARY KEY,
    doc_id INTEGER NOT NULL REFERENCES docs(doc_id),
    rev TEXT NOT NULL,
    parent INTEGER REFERENCES revs(sequence) CHECK (parent < sequence),
    current INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    available INTEGER NOT NULL DEFAULT 1,
    json TEXT,
    UNIQUE (doc_id, rev)
);
CREATE INDEX revs_by_doc ON revs(doc_id, current);
CREATE INDEX revs_by_parent ON revs(parent);

CREATE TABLE attachments (
    sequence INTEGER NOT NULL REFERENCES revs(sequence) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    key TEXT NOT NULL,
    type TEXT NOT NULL,
    encoding INTEGER NOT NULL DEFAULT 0,
    length INTEGER NOT NULL,
    encoded_length INTEGER,
    revpos INTEGER NOT NULL,
    PRIMARY KEY (sequence, filename)
);
CREATE INDEX attachments_by_key ON attachments(key);

CREATE TABLE local_docs (
    id TEXT PRIMARY KEY,
    json TEXT NOT NULL
);

CREATE TABLE info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
INSERT INTO info (key, value) VALUES ('local_seq', '0');
";

fn user_version(conn: &Connection) -> Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(storage_err)
}

/// Bring the schema up to `SCHEMA_VERSION`.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let version = user_version(conn)?;
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    if version > SCHEMA_VERSION {
        return Err(SatchelError::Storage(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    let tx = conn.transaction().map_err(storage_err)?;
    if version < 1 {
        tx.execute_batch(SCHEMA_V1).map_err(storage_err)?;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(storage_err)?;
    tx.commit().map_err(storage_err)?;

    tracing::debug!(from = version, to = SCHEMA_VERSION, "migrated schema");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(user_version(&conn).unwrap(), SCHEMA_VERSION);

        // seeded sequence counter
        let seq: String = conn
            .query_row(
                "SELECT value FROM info WHERE key = 'local_seq'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(seq, "0");
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
    }

    #[test]
    fn migrate_rejects_future_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(migrate(&mut conn).is_err());
    }

    #[test]
    fn parent_must_precede_child() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute("INSERT INTO docs (doc_id, docid) VALUES (1, 'd')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO revs (sequence, doc_id, rev, parent) VALUES (1, 1, '1-a', NULL)",
            [],
        )
        .unwrap();
        // parent >= sequence violates the acyclicity check
        let result = conn.execute(
            "INSERT INTO revs (sequence, doc_id, rev, parent) VALUES (2, 1, '2-b', 2)",
            [],
        );
        assert!(result.is_err());
    }
}
