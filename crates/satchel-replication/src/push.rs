/// The push pipeline.
///
/// Stages: local changes → remote revs_diff (chunked) → builder (document
/// JSON with `_revisions` and attachment bodies, inline base64 under the
/// threshold, multipart above it) → up to K concurrent writers → checkpoint
/// with the local sequence of the last document in the batch.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use satchel_core::document::{ChangesPage, RevisionHistory};
use satchel_core::error::{Result, SatchelError};
use satchel_core::remote::{AttachmentPayload, RemoteDatabase};
use satchel_core::revision::Revision;
use satchel_sqlite::Datastore;

use crate::checkpoint::Checkpointer;
use crate::replicator::{Progress, ReplicatorConfig};

/// Documents per `bulk_docs` call.
const BULK_CHUNK: usize = 100;

pub(crate) struct PushPipeline {
    pub store: Arc<Datastore>,
    pub remote: Arc<dyn RemoteDatabase>,
    pub config: ReplicatorConfig,
    pub cancel: CancellationToken,
    pub progress: Arc<Progress>,
    pub checkpoints: Checkpointer,
}

/// A revision assembled for shipping: protocol JSON plus any attachment
/// bodies that travel as multipart parts.
struct BuiltDoc {
    doc_id: String,
    json: serde_json::Value,
    attachments: Vec<AttachmentPayload>,
}

impl PushPipeline {
    pub(crate) async fn run(&self) -> Result<()> {
        let mut since = self.checkpoints.read().await?.ordinal();
        loop {
            if self.cancel.is_cancelled() {
                return Err(SatchelError::Cancelled);
            }

            let page = {
                let store = self.store.clone();
                let limit = self.config.batch_limit;
                tokio::task::spawn_blocking(move || store.changes(since, limit))
                    .await
                    .map_err(|e| SatchelError::Storage(format!("changes worker: {e}")))??
            };
            if page.results.is_empty() {
                break;
            }
            let drained = (page.results.len() as u64) < self.config.batch_limit;
            let batch_last = page.last_seq.clone();

            self.run_batch(&page).await?;
            self.checkpoints.advance(&batch_last).await?;
            self.progress.batch_completed();

            since = batch_last.ordinal();
            if drained {
                break;
            }
        }
        Ok(())
    }

    async fn run_batch(&self, page: &ChangesPage) -> Result<()> {
        self.progress.add_processed(page.results.len() as u64);

        // Ask the peer which of our leaf revisions it lacks.
        let mut missing: Vec<(String, Vec<Revision>)> = Vec::new();
        for chunk in page.results.chunks(self.config.revs_diff_chunk.max(1)) {
            let request: HashMap<String, Vec<Revision>> = chunk
                .iter()
                .map(|c| {
                    (
                        c.id.clone(),
                        c.changes.iter().map(|cr| cr.rev.clone()).collect(),
                    )
                })
                .collect();
            let diff = self.guarded(self.remote.revs_diff(request)).await?;
            for (id, entry) in diff {
                if !entry.missing.is_empty() {
                    missing.push((id, entry.missing));
                }
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        // Builder stage: blocking store reads off the runtime.
        let built = {
            let store = self.store.clone();
            let threshold = self.config.inline_attachment_threshold;
            tokio::task::spawn_blocking(move || {
                let mut out = Vec::new();
                for (doc_id, revs) in missing {
                    for rev in revs {
                        out.push(build_doc(&store, &doc_id, &rev, threshold)?);
                    }
                }
                Ok::<_, SatchelError>(out)
            })
            .await
            .map_err(|e| SatchelError::Storage(format!("builder worker: {e}")))??
        };
        tracing::debug!(documents = built.len(), "pushing missing revisions");

        // Writer stage: bulk_docs for inline documents, one multipart PUT
        // per attachment-heavy document, at most K calls in flight.
        let mut inline: Vec<serde_json::Value> = Vec::new();
        let mut multipart: Vec<BuiltDoc> = Vec::new();
        for doc in built {
            if doc.attachments.is_empty() {
                inline.push(doc.json);
            } else {
                multipart.push(doc);
            }
        }

        let mut join_set: JoinSet<Result<u64>> = JoinSet::new();
        let mut written = 0u64;

        let mut jobs: Vec<WriteJob> = inline
            .chunks(BULK_CHUNK)
            .map(|chunk| WriteJob::Bulk(chunk.to_vec()))
            .collect();
        jobs.extend(multipart.into_iter().map(WriteJob::Multipart));

        let mut queue = jobs.into_iter();
        loop {
            while join_set.len() >= self.config.parallelism.max(1) {
                let Some(res) = join_set.join_next().await else {
                    break;
                };
                written += flatten_join(res)?;
            }
            if self.cancel.is_cancelled() {
                return Err(SatchelError::Cancelled);
            }
            let Some(job) = queue.next() else { break };

            let remote = self.remote.clone();
            join_set.spawn(async move { job.write(remote.as_ref()).await });
        }
        while let Some(res) = join_set.join_next().await {
            written += flatten_join(res)?;
        }

        self.progress.add_written(written);
        Ok(())
    }

    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SatchelError::Cancelled),
            out = fut => out,
        }
    }
}

enum WriteJob {
    Bulk(Vec<serde_json::Value>),
    Multipart(BuiltDoc),
}

impl WriteJob {
    async fn write(self, remote: &dyn RemoteDatabase) -> Result<u64> {
        match self {
            WriteJob::Bulk(docs) => {
                let count = docs.len() as u64;
                let results = remote.bulk_docs(docs).await?;
                if let Some(failed) = results.iter().find(|r| r.error.is_some()) {
                    return Err(SatchelError::Protocol(format!(
                        "bulk_docs rejected {}: {}",
                        failed.id,
                        failed.error.as_deref().unwrap_or("unknown")
                    )));
                }
                Ok(count)
            }
            WriteJob::Multipart(doc) => {
                remote
                    .put_doc_with_attachments(&doc.doc_id, doc.json, doc.attachments)
                    .await?;
                Ok(1)
            }
        }
    }
}

/// Assemble one revision for the wire: underscore metadata, `_revisions`
/// history, and attachment bodies.
fn build_doc(
    store: &Datastore,
    doc_id: &str,
    rev: &Revision,
    inline_threshold: usize,
) -> Result<BuiltDoc> {
    let doc = store.get_rev(doc_id, rev)?;
    let history = store.revision_history(doc_id, rev)?;

    let mut json = doc.to_json();
    json["_revisions"] = serde_json::to_value(RevisionHistory::from_path(&history))?;

    let mut payloads = Vec::new();
    if !doc.attachments.is_empty() {
        let total: u64 = doc.attachments.values().map(|a| a.length).sum();
        let inline = total <= inline_threshold as u64;

        // multipart parts must arrive in the order the serialized
        // `_attachments` object lists them, which is sorted by name
        let mut names: Vec<&String> = doc.attachments.keys().collect();
        names.sort();
        for name in names {
            let att = &doc.attachments[name];
            let data = store.attachment_data(doc_id, rev, name)?;
            let entry = &mut json["_attachments"][name];
            if inline {
                entry["data"] = serde_json::Value::String(STANDARD.encode(&data));
            } else {
                entry["follows"] = serde_json::Value::Bool(true);
                payloads.push(AttachmentPayload {
                    name: name.clone(),
                    content_type: att.content_type.clone(),
                    data,
                });
            }
        }
    }

    Ok(BuiltDoc {
        doc_id: doc_id.to_string(),
        json,
        attachments: payloads,
    })
}

fn flatten_join<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    res.map_err(|e| SatchelError::Storage(format!("pipeline worker died: {e}")))?
}
