/// The local document store.
///
/// `Datastore` owns the SQLite database, the blob directory, and the event
/// bus. Every mutating operation runs in one SQL transaction that also
/// bumps the `local_seq` counter; events are delivered synchronously on the
/// mutating thread after the transaction commits.
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;

use satchel_core::document::{
    Attachment, ChangesPage, DocumentRevision, Encoding, FetchedRevision, RevsDiffEntry,
};
use satchel_core::error::{Result, SatchelError};
use satchel_core::events::{Event, EventBus, EventListener};
use satchel_core::revision::Revision;
use satchel_core::winner::{LeafRev, conflict_leaves};

use crate::adapter::{self, SqlAdapter};
use crate::blob::{BlobStore, sha1_hex};
use crate::revs::{self, ForceOutcome, RevRow};

const DB_FILE: &str = "db.sqlite3";
const ATTACHMENTS_DIR: &str = "attachments";

/// An attachment body supplied by the caller on create/update.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

struct StagedAttachment {
    name: String,
    content_type: String,
    digest: String,
    length: u64,
}

#[derive(Debug)]
pub struct Datastore {
    adapter: SqlAdapter,
    blobs: BlobStore,
    events: EventBus,
    /// Stable identifier for this store, used in replication ids.
    location: String,
}

impl Datastore {
    /// Open (or create) a store rooted at `dir`: the database file and the
    /// attachment blob directory both live underneath it.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let adapter = SqlAdapter::open(&dir.join(DB_FILE))?;
        let blobs = BlobStore::open(dir.join(ATTACHMENTS_DIR))?;
        tracing::debug!(dir = %dir.display(), "opened datastore");
        Ok(Datastore {
            adapter,
            blobs,
            events: EventBus::new(),
            location: dir.display().to_string(),
        })
    }

    /// In-memory database with blobs under `blob_dir`. Test-oriented.
    pub fn open_in_memory(blob_dir: &Path) -> Result<Self> {
        Ok(Datastore {
            adapter: SqlAdapter::open_in_memory()?,
            blobs: BlobStore::open(blob_dir)?,
            events: EventBus::new(),
            location: format!(":memory:{}", blob_dir.display()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stable identifier for this store, used to derive replication ids.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.events.subscribe(listener);
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Insert generation 1 of a new document. Fails with `DocumentExists`
    /// if a non-deleted revision is already present; a deleted winner is
    /// extended instead, resurrecting the document.
    pub fn create(
        &self,
        doc_id: &str,
        body: serde_json::Value,
        attachments: Vec<NewAttachment>,
    ) -> Result<DocumentRevision> {
        validate_doc_id(doc_id)?;
        validate_body(&body)?;
        let staged = self.stage_attachments(attachments)?;

        let doc = self.adapter.transaction(|tx| {
            let parent = match revs::winner(tx, doc_id)? {
                Some(w) if !w.deleted => {
                    return Err(SatchelError::DocumentExists(doc_id.to_string()));
                }
                other => other,
            };

            let row = revs::insert_child(tx, doc_id, parent.as_ref(), &body, false)?;
            apply_staged(tx, row.sequence, row.rev.pos, &staged)?;
            row_to_document(tx, row)
        })?;

        self.events.post(Event::DocumentCreated {
            doc_id: doc.doc_id.clone(),
            rev: doc.rev.clone(),
        });
        Ok(doc)
    }

    /// Derive a child revision from a current leaf. The parent's
    /// attachments carry forward unless shadowed by name.
    pub fn update(
        &self,
        doc_id: &str,
        parent_rev: &Revision,
        body: serde_json::Value,
        attachments: Vec<NewAttachment>,
    ) -> Result<DocumentRevision> {
        validate_body(&body)?;
        let staged = self.stage_attachments(attachments)?;

        let doc = self.adapter.transaction(|tx| {
            let parent = current_leaf(tx, doc_id, parent_rev)?;
            let row = revs::insert_child(tx, doc_id, Some(&parent), &body, false)?;

            revs::copy_attachments(tx, parent.sequence, row.sequence)?;
            apply_staged(tx, row.sequence, row.rev.pos, &staged)?;
            row_to_document(tx, row)
        })?;

        self.events.post(Event::DocumentUpdated {
            doc_id: doc.doc_id.clone(),
            rev: doc.rev.clone(),
        });
        Ok(doc)
    }

    /// Delete by appending a tombstone leaf: empty body, `deleted = true`,
    /// no attachments.
    pub fn delete(&self, doc_id: &str, rev: &Revision) -> Result<DocumentRevision> {
        let doc = self.adapter.transaction(|tx| {
            let parent = current_leaf(tx, doc_id, rev)?;
            let row = revs::insert_child(tx, doc_id, Some(&parent), &serde_json::json!({}), true)?;
            row_to_document(tx, row)
        })?;

        self.events.post(Event::DocumentDeleted {
            doc_id: doc.doc_id.clone(),
            rev: doc.rev.clone(),
        });
        Ok(doc)
    }

    /// New revision identical to the parent but without attachment `name`.
    pub fn remove_attachment(
        &self,
        doc_id: &str,
        parent_rev: &Revision,
        name: &str,
    ) -> Result<DocumentRevision> {
        let doc = self.adapter.transaction(|tx| {
            let parent = current_leaf(tx, doc_id, parent_rev)?;
            let body = parent.body()?;
            let row = revs::insert_child(tx, doc_id, Some(&parent), &body, false)?;

            revs::copy_attachments(tx, parent.sequence, row.sequence)?;
            if !revs::remove_attachment_row(tx, row.sequence, name)? {
                return Err(SatchelError::DocumentMissing(format!(
                    "attachment {name} on {doc_id}"
                )));
            }
            row_to_document(tx, row)
        })?;

        self.events.post(Event::DocumentUpdated {
            doc_id: doc.doc_id.clone(),
            rev: doc.rev.clone(),
        });
        Ok(doc)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The winning revision. A document whose winner is a tombstone reads
    /// as missing.
    pub fn get(&self, doc_id: &str) -> Result<DocumentRevision> {
        self.adapter.read(|conn| {
            let winner = revs::winner(conn, doc_id)?
                .filter(|w| !w.deleted)
                .ok_or_else(|| SatchelError::DocumentMissing(doc_id.to_string()))?;
            row_to_document(conn, winner)
        })
    }

    /// Exact revision lookup, tombstones included.
    pub fn get_rev(&self, doc_id: &str, rev: &Revision) -> Result<DocumentRevision> {
        self.adapter.read(|conn| {
            let row = revs::get_rev(conn, doc_id, rev)?
                .ok_or_else(|| SatchelError::DocumentMissing(format!("{doc_id} at {rev}")))?;
            if !row.available {
                return Err(SatchelError::DocumentMissing(format!(
                    "{doc_id} at {rev} (compacted)"
                )));
            }
            row_to_document(conn, row)
        })
    }

    /// Non-winning, non-deleted leaves.
    pub fn conflicts(&self, doc_id: &str) -> Result<Vec<DocumentRevision>> {
        self.adapter.read(|conn| {
            let leaf_rows = revs::leaves(conn, doc_id)?;
            let leaf_revs: Vec<LeafRev> = leaf_rows.iter().map(RevRow::leaf_rev).collect();
            let losing: Vec<Revision> = conflict_leaves(&leaf_revs)
                .into_iter()
                .map(|l| l.rev.clone())
                .collect();
            leaf_rows
                .into_iter()
                .filter(|r| losing.contains(&r.rev))
                .map(|r| row_to_document(conn, r))
                .collect()
        })
    }

    /// All leaf revisions of a document, winners and conflicts alike.
    pub fn leaf_revisions(&self, doc_id: &str) -> Result<Vec<Revision>> {
        self.adapter.read(|conn| {
            Ok(revs::leaves(conn, doc_id)?
                .into_iter()
                .map(|r| r.rev)
                .collect())
        })
    }

    /// Change feed entries with sequence greater than `since`, at most
    /// `limit`, strictly ascending.
    pub fn changes(&self, since: u64, limit: u64) -> Result<ChangesPage> {
        self.adapter.read(|conn| revs::changes(conn, since, limit))
    }

    /// Which of the supplied revisions this store lacks. A revision stored
    /// only as an unavailable stub counts as missing, its body is wanted.
    pub fn revs_diff(
        &self,
        revs: HashMap<String, Vec<Revision>>,
    ) -> Result<HashMap<String, RevsDiffEntry>> {
        self.adapter.read(|conn| {
            let mut out = HashMap::new();
            for (doc_id, candidates) in revs {
                let mut missing = Vec::new();
                for rev in candidates {
                    let have = revs::get_rev(conn, &doc_id, &rev)?
                        .map(|row| row.available)
                        .unwrap_or(false);
                    if !have {
                        missing.push(rev);
                    }
                }
                if !missing.is_empty() {
                    out.insert(
                        doc_id,
                        RevsDiffEntry {
                            missing,
                            possible_ancestors: vec![],
                        },
                    );
                }
            }
            Ok(out)
        })
    }

    /// Root-first ancestor path of a revision.
    pub fn revision_history(&self, doc_id: &str, rev: &Revision) -> Result<Vec<Revision>> {
        self.adapter.read(|conn| {
            let row = revs::get_rev(conn, doc_id, rev)?
                .ok_or_else(|| SatchelError::DocumentMissing(format!("{doc_id} at {rev}")))?;
            Ok(revs::path_from_root(conn, row.sequence)?
                .into_iter()
                .map(|r| r.rev)
                .collect())
        })
    }

    pub fn document_count(&self) -> Result<u64> {
        self.adapter.read(|conn| {
            let mut count = 0u64;
            for docid in revs::all_docids(conn)? {
                if revs::winner(conn, &docid)?.is_some_and(|w| !w.deleted) {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    pub fn document_ids(&self) -> Result<Vec<String>> {
        self.adapter.read(revs::all_docids)
    }

    /// The store's current sequence counter.
    pub fn local_seq(&self) -> Result<u64> {
        self.adapter
            .read(|conn| Ok(revs::current_local_seq(conn)? as u64))
    }

    // -----------------------------------------------------------------------
    // Replication inbound
    // -----------------------------------------------------------------------

    /// Splice a fetched remote revision (with its ancestor history and any
    /// attachment bodies) into the local tree. Returns whether anything was
    /// written; re-inserting an existing revision is a no-op.
    pub fn force_insert(&self, fetched: &FetchedRevision) -> Result<bool> {
        validate_doc_id(&fetched.doc_id)?;

        // Blob writes happen before the row transaction: content-addressed
        // files orphaned by a failed transaction are reclaimed by GC.
        for (name, att) in &fetched.attachments {
            self.store_fetched_blob(name, att, &fetched.attachment_bodies)?;
        }

        let outcome = self.adapter.transaction(|tx| {
            let outcome = revs::insert_with_history(
                tx,
                &fetched.doc_id,
                &fetched.history,
                &fetched.body,
                fetched.deleted,
            )?;

            let leaf_seq = match &outcome {
                ForceOutcome::Noop => None,
                ForceOutcome::Filled(seq) => Some(*seq),
                ForceOutcome::Inserted { sequence, .. } => Some(*sequence),
            };
            if let Some(seq) = leaf_seq {
                for (name, att) in &fetched.attachments {
                    let plain = Attachment {
                        encoding: Encoding::Plain,
                        stub: false,
                        data: None,
                        follows: false,
                        ..att.clone()
                    };
                    revs::insert_attachment(tx, seq, name, &plain)?;
                }
            }
            Ok(outcome)
        })?;

        let event = match outcome {
            ForceOutcome::Noop => {
                tracing::debug!(doc_id = %fetched.doc_id, rev = %fetched.rev, "force_insert no-op");
                return Ok(false);
            }
            ForceOutcome::Inserted { new_doc: true, .. } => Event::DocumentCreated {
                doc_id: fetched.doc_id.clone(),
                rev: fetched.rev.clone(),
            },
            _ if fetched.deleted => Event::DocumentDeleted {
                doc_id: fetched.doc_id.clone(),
                rev: fetched.rev.clone(),
            },
            _ => Event::DocumentUpdated {
                doc_id: fetched.doc_id.clone(),
                rev: fetched.rev.clone(),
            },
        };
        self.events.post(event);
        Ok(true)
    }

    /// Write one pulled attachment body to the blob store, inflating gzip
    /// transfers and verifying the digest. Bodies we already hold may be
    /// omitted by the peer (`atts_since`).
    fn store_fetched_blob(
        &self,
        name: &str,
        att: &Attachment,
        bodies: &HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        if self.blobs.exists(&att.digest) {
            return Ok(());
        }
        let Some(bytes) = bodies.get(&att.digest) else {
            return Err(SatchelError::Protocol(format!(
                "attachment {name} body missing for digest {}",
                att.digest
            )));
        };

        let plain: Vec<u8> = match att.encoding {
            Encoding::Plain => bytes.clone(),
            Encoding::Gzip => {
                let mut decoder = GzDecoder::new(&bytes[..]);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).map_err(|e| {
                    SatchelError::Protocol(format!("attachment {name} gzip: {e}"))
                })?;
                out
            }
        };
        if sha1_hex(&plain) != att.digest {
            return Err(SatchelError::Protocol(format!(
                "attachment {name} digest mismatch"
            )));
        }
        self.blobs.put_bytes(&plain)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    /// Decoded attachment bytes for a specific revision.
    pub fn attachment_data(&self, doc_id: &str, rev: &Revision, name: &str) -> Result<Vec<u8>> {
        let doc = self.get_rev(doc_id, rev)?;
        let att = doc
            .attachments
            .get(name)
            .ok_or_else(|| SatchelError::DocumentMissing(format!("attachment {name}")))?;
        self.blobs.read_decoded(&att.digest, att.encoding)
    }

    /// Lazily open the raw blob behind an attachment.
    pub fn open_attachment(&self, att: &Attachment) -> Result<fs::File> {
        self.blobs.get(&att.digest)
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    // -----------------------------------------------------------------------
    // Local (non-replicated) documents
    // -----------------------------------------------------------------------

    pub fn put_local(&self, id: &str, body: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(body)?;
        self.adapter.execute(
            "INSERT OR REPLACE INTO local_docs (id, json) VALUES (?1, ?2)",
            rusqlite::params![id, json],
        )?;
        Ok(())
    }

    pub fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>> {
        self.adapter.read(|conn| {
            let json = adapter::query_opt(
                conn,
                "SELECT json FROM local_docs WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get::<_, String>(0),
            )?;
            json.map(|j| serde_json::from_str(&j).map_err(Into::into))
                .transpose()
        })
    }

    pub fn delete_local(&self, id: &str) -> Result<()> {
        self.adapter.execute(
            "DELETE FROM local_docs WHERE id = ?1",
            rusqlite::params![id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Clear bodies of non-leaf revisions more than `depth` edges from any
    /// leaf, across all documents. Revision ids are kept.
    pub fn compact(&self, depth: u64) -> Result<usize> {
        let compacted = self.adapter.transaction(|tx| {
            let mut total = 0;
            for docid in revs::all_docids(tx)? {
                total += revs::compact_doc(tx, &docid, depth)?;
            }
            Ok(total)
        })?;
        tracing::debug!(compacted, depth, "compacted revision bodies");
        Ok(compacted)
    }

    /// Delete blobs no revision references anymore. Returns the number
    /// removed.
    pub fn collect_garbage(&self) -> Result<usize> {
        let live = self.adapter.read(revs::live_attachment_keys)?;
        let removed = self.blobs.retain(&live)?;
        if removed > 0 {
            tracing::debug!(removed, "collected unreferenced blobs");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn stage_attachments(&self, attachments: Vec<NewAttachment>) -> Result<Vec<StagedAttachment>> {
        attachments
            .into_iter()
            .map(|att| {
                let (digest, length) = self.blobs.put_bytes(&att.data)?;
                Ok(StagedAttachment {
                    name: att.name,
                    content_type: att.content_type,
                    digest,
                    length,
                })
            })
            .collect()
    }
}

fn current_leaf(conn: &rusqlite::Connection, doc_id: &str, rev: &Revision) -> Result<RevRow> {
    let row = revs::get_rev(conn, doc_id, rev)?
        .ok_or_else(|| SatchelError::DocumentMissing(format!("{doc_id} at {rev}")))?;
    if !row.current {
        return Err(SatchelError::Conflict);
    }
    Ok(row)
}

fn row_to_document(conn: &rusqlite::Connection, row: RevRow) -> Result<DocumentRevision> {
    let attachments = revs::load_attachments(conn, row.sequence)?;
    Ok(DocumentRevision {
        doc_id: row.docid.clone(),
        rev: row.rev.clone(),
        sequence: row.sequence as u64,
        deleted: row.deleted,
        current: row.current,
        available: row.available,
        body: row.body()?,
        attachments,
    })
}

fn apply_staged(
    conn: &rusqlite::Connection,
    sequence: i64,
    revpos: u64,
    staged: &[StagedAttachment],
) -> Result<()> {
    for s in staged {
        let att = Attachment {
            content_type: s.content_type.clone(),
            digest: s.digest.clone(),
            length: s.length,
            encoded_length: None,
            revpos,
            encoding: Encoding::Plain,
            stub: false,
            data: None,
            follows: false,
        };
        revs::insert_attachment(conn, sequence, &s.name, &att)?;
    }
    Ok(())
}

fn validate_doc_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() {
        return Err(SatchelError::BadRequest("empty document id".into()));
    }
    if doc_id.chars().any(|c| c.is_control()) {
        return Err(SatchelError::BadRequest(format!(
            "document id contains control characters: {doc_id:?}"
        )));
    }
    Ok(())
}

fn validate_body(body: &serde_json::Value) -> Result<()> {
    let Some(obj) = body.as_object() else {
        return Err(SatchelError::BadRequest("body must be a JSON object".into()));
    };
    if let Some(key) = obj.keys().find(|k| k.starts_with('_')) {
        return Err(SatchelError::BadRequest(format!(
            "body must not contain reserved key {key}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
