use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::{ChangesPage, DocResult, FetchedRevision, RevsDiffEntry};
use crate::error::Result;
use crate::revision::{Revision, Seq};

/// Summary returned by the database root endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbInfo {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub update_seq: Seq,
}

/// An attachment body travelling with a multipart document write.
#[derive(Debug, Clone)]
pub struct AttachmentPayload {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A remote CouchDB-compatible endpoint, as much of the replication
/// protocol as the pull and push pipelines need.
///
/// Implementations must be retry-safe: every operation may be re-issued
/// after a transient failure without side effects beyond idempotent writes.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Stable URI of this endpoint, used to derive replication ids.
    fn url(&self) -> String;

    /// Database root. Used to verify the endpoint before a replication run.
    async fn db_info(&self) -> Result<DbInfo>;

    /// Poll the change feed (non-continuous).
    async fn changes(&self, since: &Seq, limit: u64) -> Result<ChangesPage>;

    /// Ask which of the supplied revisions the peer lacks.
    async fn revs_diff(
        &self,
        revs: HashMap<String, Vec<Revision>>,
    ) -> Result<HashMap<String, RevsDiffEntry>>;

    /// Fetch specific revision branches of one document, each with its full
    /// ancestor path. `atts_since` lets the peer omit attachment bodies the
    /// caller already has. When `attachments_inline` is false attachment
    /// bodies arrive as multipart parts rather than base64.
    async fn open_revs(
        &self,
        doc_id: &str,
        revs: &[Revision],
        atts_since: &[Revision],
        attachments_inline: bool,
    ) -> Result<Vec<FetchedRevision>>;

    /// Write already-formed revisions with history (`new_edits=false`),
    /// preserving revision ids.
    async fn bulk_docs(&self, docs: Vec<serde_json::Value>) -> Result<Vec<DocResult>>;

    /// Write one document together with its attachment bodies as a
    /// multipart/related request.
    async fn put_doc_with_attachments(
        &self,
        doc_id: &str,
        doc: serde_json::Value,
        attachments: Vec<AttachmentPayload>,
    ) -> Result<()>;

    /// Read the replication checkpoint, `None` if never written.
    async fn get_checkpoint(&self, replication_id: &str) -> Result<Option<Seq>>;

    /// Persist the replication checkpoint. Writing the same `last_seq`
    /// twice is a no-op.
    async fn put_checkpoint(&self, replication_id: &str, last_seq: &Seq) -> Result<()>;
}
