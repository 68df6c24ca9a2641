/// Relational revision-tree operations.
///
/// Revisions live in the `revs` table, one row per revision, linked by
/// `parent` sequence. Leaves carry `current = 1`; history stubs spliced in
/// by replication carry `available = 0` and no body. All functions here
/// expect to run inside the caller's transaction and go through the
/// adapter's verb helpers for statement execution.
use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, params};

use satchel_core::canonical::new_rev_id;
use satchel_core::document::{Attachment, ChangeEvent, ChangeRev, ChangesPage, Encoding};
use satchel_core::error::{Result, SatchelError};
use satchel_core::revision::{Revision, Seq};
use satchel_core::winner::{LeafRev, sort_leaves, winning_leaf};

use crate::adapter;

#[derive(Debug, Clone)]
pub(crate) struct RevRow {
    pub sequence: i64,
    pub doc_numeric_id: i64,
    pub docid: String,
    pub rev: Revision,
    pub parent: Option<i64>,
    pub current: bool,
    pub deleted: bool,
    pub available: bool,
    pub json: Option<String>,
}

impl RevRow {
    pub fn leaf_rev(&self) -> LeafRev {
        LeafRev {
            rev: self.rev.clone(),
            deleted: self.deleted,
        }
    }

    pub fn body(&self) -> Result<serde_json::Value> {
        match &self.json {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(serde_json::json!({})),
        }
    }
}

const REV_COLUMNS: &str =
    "r.sequence, r.doc_id, d.docid, r.rev, r.parent, r.current, r.deleted, r.available, r.json";

fn map_rev_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RevRow, String)> {
    let rev_str: String = row.get(3)?;
    Ok((
        RevRow {
            sequence: row.get(0)?,
            doc_numeric_id: row.get(1)?,
            docid: row.get(2)?,
            rev: Revision::new(1, ""), // replaced after parsing below
            parent: row.get(4)?,
            current: row.get(5)?,
            deleted: row.get(6)?,
            available: row.get(7)?,
            json: row.get(8)?,
        },
        rev_str,
    ))
}

fn finish_row((mut row, rev_str): (RevRow, String)) -> Result<RevRow> {
    row.rev = rev_str
        .parse()
        .map_err(|_| SatchelError::Storage(format!("corrupt revision id: {rev_str}")))?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Documents and sequences
// ---------------------------------------------------------------------------

pub(crate) fn doc_numeric_id(conn: &Connection, docid: &str) -> Result<Option<i64>> {
    adapter::query_opt(
        conn,
        "SELECT doc_id FROM docs WHERE docid = ?1",
        params![docid],
        |row| row.get(0),
    )
}

pub(crate) fn get_or_create_doc(conn: &Connection, docid: &str) -> Result<i64> {
    if let Some(id) = doc_numeric_id(conn, docid)? {
        return Ok(id);
    }
    adapter::insert(conn, "INSERT INTO docs (docid) VALUES (?1)", params![docid])
}

pub(crate) fn current_local_seq(conn: &Connection) -> Result<i64> {
    let value = adapter::query_opt(
        conn,
        "SELECT value FROM info WHERE key = 'local_seq'",
        [],
        |row| row.get::<_, String>(0),
    )?
    .ok_or_else(|| SatchelError::Storage("local_seq counter missing".into()))?;
    value
        .parse()
        .map_err(|_| SatchelError::Storage(format!("corrupt local_seq: {value}")))
}

/// Allocate the next sequence number. Runs under the caller's transaction,
/// so the bump is atomic with the revision insert it pays for.
pub(crate) fn next_sequence(conn: &Connection) -> Result<i64> {
    let next = current_local_seq(conn)? + 1;
    adapter::execute(
        conn,
        "UPDATE info SET value = ?1 WHERE key = 'local_seq'",
        params![next.to_string()],
    )?;
    Ok(next)
}

// ---------------------------------------------------------------------------
// Row access
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn insert_rev_row(
    conn: &Connection,
    sequence: i64,
    doc_numeric_id: i64,
    rev: &Revision,
    parent: Option<i64>,
    current: bool,
    deleted: bool,
    available: bool,
    json: Option<&str>,
) -> Result<()> {
    adapter::execute(
        conn,
        "INSERT INTO revs (sequence, doc_id, rev, parent, current, deleted, available, json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sequence,
            doc_numeric_id,
            rev.to_string(),
            parent,
            current,
            deleted,
            available,
            json
        ],
    )?;
    Ok(())
}

fn mark_not_current(conn: &Connection, sequence: i64) -> Result<()> {
    adapter::execute(
        conn,
        "UPDATE revs SET current = 0 WHERE sequence = ?1",
        params![sequence],
    )?;
    Ok(())
}

/// Append a child revision to `parent`, or start a new root when there is
/// no parent: derive the revision id from the body, retire the parent's
/// leaf flag, allocate the next sequence, insert the row `current = true`.
pub(crate) fn insert_child(
    conn: &Connection,
    docid: &str,
    parent: Option<&RevRow>,
    body: &serde_json::Value,
    deleted: bool,
) -> Result<RevRow> {
    let rev = new_rev_id(parent.map(|p| &p.rev), body, deleted);
    let doc_numeric_id = match parent {
        Some(p) => p.doc_numeric_id,
        None => get_or_create_doc(conn, docid)?,
    };
    if let Some(p) = parent {
        mark_not_current(conn, p.sequence)?;
    }

    let sequence = next_sequence(conn)?;
    let json = serde_json::to_string(body)?;
    insert_rev_row(
        conn,
        sequence,
        doc_numeric_id,
        &rev,
        parent.map(|p| p.sequence),
        true,
        deleted,
        true,
        Some(&json),
    )?;

    Ok(RevRow {
        sequence,
        doc_numeric_id,
        docid: docid.to_string(),
        rev,
        parent: parent.map(|p| p.sequence),
        current: true,
        deleted,
        available: true,
        json: Some(json),
    })
}

pub(crate) fn get_rev(conn: &Connection, docid: &str, rev: &Revision) -> Result<Option<RevRow>> {
    let raw = adapter::query_opt(
        conn,
        &format!(
            "SELECT {REV_COLUMNS} FROM revs r JOIN docs d ON r.doc_id = d.doc_id
             WHERE d.docid = ?1 AND r.rev = ?2"
        ),
        params![docid, rev.to_string()],
        map_rev_row,
    )?;
    raw.map(finish_row).transpose()
}

pub(crate) fn get_by_sequence(conn: &Connection, sequence: i64) -> Result<Option<RevRow>> {
    let raw = adapter::query_opt(
        conn,
        &format!(
            "SELECT {REV_COLUMNS} FROM revs r JOIN docs d ON r.doc_id = d.doc_id
             WHERE r.sequence = ?1"
        ),
        params![sequence],
        map_rev_row,
    )?;
    raw.map(finish_row).transpose()
}

/// All leaf revisions of a document.
pub(crate) fn leaves(conn: &Connection, docid: &str) -> Result<Vec<RevRow>> {
    let rows = adapter::query_rows(
        conn,
        &format!(
            "SELECT {REV_COLUMNS} FROM revs r JOIN docs d ON r.doc_id = d.doc_id
             WHERE d.docid = ?1 AND r.current = 1"
        ),
        params![docid],
        map_rev_row,
    )?;
    rows.into_iter().map(finish_row).collect()
}

fn doc_rows(conn: &Connection, docid: &str) -> Result<Vec<RevRow>> {
    let rows = adapter::query_rows(
        conn,
        &format!(
            "SELECT {REV_COLUMNS} FROM revs r JOIN docs d ON r.doc_id = d.doc_id
             WHERE d.docid = ?1"
        ),
        params![docid],
        map_rev_row,
    )?;
    rows.into_iter().map(finish_row).collect()
}

/// The winning leaf of a document, by the deterministic rule.
pub(crate) fn winner(conn: &Connection, docid: &str) -> Result<Option<RevRow>> {
    let leaf_rows = leaves(conn, docid)?;
    let leaf_revs: Vec<LeafRev> = leaf_rows.iter().map(RevRow::leaf_rev).collect();
    let Some(winner) = winning_leaf(&leaf_revs) else {
        return Ok(None);
    };
    Ok(leaf_rows.into_iter().find(|r| r.rev == winner.rev))
}

/// Ancestor chain of a revision, root first, ending at `sequence`.
pub(crate) fn path_from_root(conn: &Connection, sequence: i64) -> Result<Vec<RevRow>> {
    let mut path = Vec::new();
    let mut next = Some(sequence);
    while let Some(seq) = next {
        let row = get_by_sequence(conn, seq)?
            .ok_or_else(|| SatchelError::Storage(format!("dangling parent sequence {seq}")))?;
        next = row.parent;
        path.push(row);
    }
    path.reverse();
    Ok(path)
}

// ---------------------------------------------------------------------------
// insert_with_history — replication inbound
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ForceOutcome {
    /// Leaf already present with its body. Nothing written.
    Noop,
    /// Leaf was a history stub; its body is now available.
    Filled(i64),
    /// New revision (and possibly stub ancestors) inserted.
    Inserted { sequence: i64, new_doc: bool },
}

/// Splice a remote revision branch into the local tree.
///
/// `history` is the full ancestor path, oldest first, ending at the
/// revision whose `body` is supplied. Ancestors not stored locally are
/// created as unavailable stubs.
pub(crate) fn insert_with_history(
    conn: &Connection,
    docid: &str,
    history: &[Revision],
    body: &serde_json::Value,
    deleted: bool,
) -> Result<ForceOutcome> {
    let Some(leaf_rev) = history.last() else {
        return Err(SatchelError::BadRequest("empty revision history".into()));
    };
    for pair in history.windows(2) {
        if pair[1].pos != pair[0].pos + 1 {
            return Err(SatchelError::BadRequest(format!(
                "non-consecutive revision history at {}",
                pair[1]
            )));
        }
    }

    let json = serde_json::to_string(body)?;

    if let Some(existing) = get_rev(conn, docid, leaf_rev)? {
        if existing.available {
            return Ok(ForceOutcome::Noop);
        }
        adapter::execute(
            conn,
            "UPDATE revs SET json = ?1, available = 1, deleted = ?2 WHERE sequence = ?3",
            params![json, deleted, existing.sequence],
        )?;
        return Ok(ForceOutcome::Filled(existing.sequence));
    }

    let new_doc = doc_numeric_id(conn, docid)?.is_none();
    let doc_id = get_or_create_doc(conn, docid)?;

    // Deepest ancestor already stored locally, if any.
    let mut parent: Option<RevRow> = None;
    let mut graft_from = 0;
    for (i, rev) in history[..history.len() - 1].iter().enumerate().rev() {
        if let Some(row) = get_rev(conn, docid, rev)? {
            graft_from = i + 1;
            parent = Some(row);
            break;
        }
    }

    if let Some(row) = &parent
        && row.current
    {
        mark_not_current(conn, row.sequence)?;
    }
    let mut parent_seq = parent.map(|r| r.sequence);

    // Missing intermediate ancestors become unavailable stubs.
    for rev in &history[graft_from..history.len() - 1] {
        let seq = next_sequence(conn)?;
        insert_rev_row(conn, seq, doc_id, rev, parent_seq, false, false, false, None)?;
        parent_seq = Some(seq);
    }

    let sequence = next_sequence(conn)?;
    insert_rev_row(
        conn,
        sequence,
        doc_id,
        leaf_rev,
        parent_seq,
        true,
        deleted,
        true,
        Some(&json),
    )?;

    Ok(ForceOutcome::Inserted { sequence, new_doc })
}

// ---------------------------------------------------------------------------
// Changes feed
// ---------------------------------------------------------------------------

/// Documents changed after `since`, ordered by the sequence of their latest
/// revision, at most `limit` entries.
pub(crate) fn changes(conn: &Connection, since: u64, limit: u64) -> Result<ChangesPage> {
    let limit = limit.min(i64::MAX as u64) as i64;
    let docs = adapter::query_rows(
        conn,
        "SELECT d.docid, MAX(r.sequence) AS seq
         FROM revs r JOIN docs d ON r.doc_id = d.doc_id
         GROUP BY r.doc_id HAVING MAX(r.sequence) > ?1
         ORDER BY seq ASC LIMIT ?2",
        params![since as i64, limit],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
    )?;

    let mut results = Vec::with_capacity(docs.len());
    let mut last_seq = since;
    for (docid, seq) in docs {
        let leaf_rows = leaves(conn, &docid)?;
        let mut leaf_revs: Vec<LeafRev> = leaf_rows.iter().map(RevRow::leaf_rev).collect();
        if leaf_revs.is_empty() {
            continue;
        }
        sort_leaves(&mut leaf_revs);
        let deleted = leaf_revs[0].deleted;
        results.push(ChangeEvent {
            seq: Seq::Local(seq as u64),
            id: docid,
            changes: leaf_revs
                .into_iter()
                .map(|l| ChangeRev { rev: l.rev })
                .collect(),
            deleted,
        });
        last_seq = seq as u64;
    }

    Ok(ChangesPage {
        results,
        last_seq: Seq::Local(last_seq),
    })
}

// ---------------------------------------------------------------------------
// Attachment rows
// ---------------------------------------------------------------------------

pub(crate) fn load_attachments(
    conn: &Connection,
    sequence: i64,
) -> Result<HashMap<String, Attachment>> {
    let rows = adapter::query_rows(
        conn,
        "SELECT filename, key, type, encoding, length, encoded_length, revpos
         FROM attachments WHERE sequence = ?1",
        params![sequence],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                Attachment {
                    content_type: row.get(2)?,
                    digest: row.get(1)?,
                    length: row.get::<_, i64>(4)? as u64,
                    encoded_length: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
                    revpos: row.get::<_, i64>(6)? as u64,
                    encoding: Encoding::from_i64(row.get(3)?),
                    stub: false,
                    data: None,
                    follows: false,
                },
            ))
        },
    )?;
    Ok(rows.into_iter().collect())
}

pub(crate) fn insert_attachment(
    conn: &Connection,
    sequence: i64,
    name: &str,
    att: &Attachment,
) -> Result<()> {
    adapter::execute(
        conn,
        "INSERT OR REPLACE INTO attachments
         (sequence, filename, key, type, encoding, length, encoded_length, revpos)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sequence,
            name,
            att.digest,
            att.content_type,
            att.encoding.as_i64(),
            att.length as i64,
            att.encoded_length.map(|n| n as i64),
            att.revpos as i64
        ],
    )?;
    Ok(())
}

/// Carry a parent revision's attachments forward to a child revision.
pub(crate) fn copy_attachments(conn: &Connection, from: i64, to: i64) -> Result<()> {
    adapter::execute(
        conn,
        "INSERT INTO attachments
         (sequence, filename, key, type, encoding, length, encoded_length, revpos)
         SELECT ?2, filename, key, type, encoding, length, encoded_length, revpos
         FROM attachments WHERE sequence = ?1",
        params![from, to],
    )?;
    Ok(())
}

pub(crate) fn remove_attachment_row(conn: &Connection, sequence: i64, name: &str) -> Result<bool> {
    let n = adapter::execute(
        conn,
        "DELETE FROM attachments WHERE sequence = ?1 AND filename = ?2",
        params![sequence, name],
    )?;
    Ok(n > 0)
}

/// Every blob key still referenced by some revision.
pub(crate) fn live_attachment_keys(conn: &Connection) -> Result<HashSet<String>> {
    let keys = adapter::query_rows(conn, "SELECT DISTINCT key FROM attachments", [], |row| {
        row.get::<_, String>(0)
    })?;
    Ok(keys.into_iter().collect())
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// Clear bodies of non-leaf revisions more than `depth` edges away from
/// every leaf. Revision ids stay for protocol compatibility.
pub(crate) fn compact_doc(conn: &Connection, docid: &str, depth: u64) -> Result<usize> {
    let rows = doc_rows(conn, docid)?;
    let by_seq: HashMap<i64, &RevRow> = rows.iter().map(|r| (r.sequence, r)).collect();

    // Distance from the nearest descendant leaf, walking parent links up.
    let mut keep: HashSet<i64> = HashSet::new();
    for leaf in rows.iter().filter(|r| r.current) {
        let mut cursor = Some(leaf.sequence);
        let mut distance = 0u64;
        while let Some(seq) = cursor {
            if distance > depth {
                break;
            }
            keep.insert(seq);
            cursor = by_seq.get(&seq).and_then(|r| r.parent);
            distance += 1;
        }
    }

    let mut compacted = 0;
    for row in &rows {
        if row.current || keep.contains(&row.sequence) || !row.available {
            continue;
        }
        adapter::execute(
            conn,
            "UPDATE revs SET json = NULL, available = 0 WHERE sequence = ?1",
            params![row.sequence],
        )?;
        adapter::execute(
            conn,
            "DELETE FROM attachments WHERE sequence = ?1",
            params![row.sequence],
        )?;
        compacted += 1;
    }
    Ok(compacted)
}

pub(crate) fn all_docids(conn: &Connection) -> Result<Vec<String>> {
    adapter::query_rows(conn, "SELECT docid FROM docs ORDER BY docid", [], |row| {
        row.get::<_, String>(0)
    })
}
