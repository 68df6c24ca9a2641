/// The pull pipeline.
///
/// Stages: changes feed → revs_diff (chunked) → fetchers (up to K
/// concurrent `open_revs`) → a single-writer insert stage → checkpoint.
/// Stages hand off through a bounded queue; the checkpoint advances only
/// after every insert of the batch is durable. Cancellation is observed
/// between stages and never advances the checkpoint past an unfinished
/// batch.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use satchel_core::document::{ChangesPage, FetchedRevision};
use satchel_core::error::{Result, SatchelError};
use satchel_core::remote::RemoteDatabase;
use satchel_core::revision::Revision;
use satchel_sqlite::Datastore;

use crate::checkpoint::Checkpointer;
use crate::replicator::{Progress, ReplicatorConfig};

pub(crate) struct PullPipeline {
    pub store: Arc<Datastore>,
    pub remote: Arc<dyn RemoteDatabase>,
    pub config: ReplicatorConfig,
    pub cancel: CancellationToken,
    pub progress: Arc<Progress>,
    pub checkpoints: Checkpointer,
}

impl PullPipeline {
    pub(crate) async fn run(&self) -> Result<()> {
        let mut since = self.checkpoints.read().await?;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SatchelError::Cancelled);
            }

            let page = self
                .guarded(self.remote.changes(&since, self.config.batch_limit))
                .await?;
            if page.results.is_empty() {
                break;
            }
            let drained = (page.results.len() as u64) < self.config.batch_limit;
            let batch_last = page.last_seq.clone();

            self.run_batch(page).await?;
            self.checkpoints.advance(&batch_last).await?;
            self.progress.batch_completed();

            since = batch_last;
            if drained {
                break;
            }
        }
        Ok(())
    }

    async fn run_batch(&self, page: ChangesPage) -> Result<()> {
        self.progress.add_processed(page.results.len() as u64);

        // Narrow the batch to revisions the local store lacks. In a pull
        // the receiving peer answers revs_diff, and that peer is us.
        let mut work: Vec<(String, Vec<Revision>)> = Vec::new();
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
            let diff = {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || store.revs_diff(request))
                    .await
                    .map_err(|e| SatchelError::Storage(format!("revs_diff worker: {e}")))??
            };
            for (id, entry) in diff {
                if !entry.missing.is_empty() {
                    work.push((id, entry.missing));
                }
            }
        }
        if work.is_empty() {
            return Ok(());
        }
        tracing::debug!(documents = work.len(), "pulling missing revisions");

        let (tx, mut rx) = mpsc::channel::<FetchedRevision>(self.config.parallelism.max(1) * 2);

        // Single-writer insert stage: inserts within the batch may land in
        // any order, the checkpoint waits for all of them.
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let inserter = tokio::spawn(async move {
            let mut written = 0u64;
            while let Some(fetched) = rx.recv().await {
                if cancel.is_cancelled() {
                    return Err(SatchelError::Cancelled);
                }
                let store = store.clone();
                let wrote = tokio::task::spawn_blocking(move || store.force_insert(&fetched))
                    .await
                    .map_err(|e| SatchelError::Storage(format!("insert worker: {e}")))??;
                if wrote {
                    written += 1;
                }
            }
            Ok(written)
        });

        let fetch_result = self.fetch_all(work, tx).await;
        let written = inserter
            .await
            .map_err(|e| SatchelError::Storage(format!("insert worker: {e}")))??;
        fetch_result?;
        self.progress.add_written(written);
        Ok(())
    }

    /// Fetch stage: up to K concurrent `open_revs` calls feeding the
    /// bounded insert queue.
    async fn fetch_all(
        &self,
        work: Vec<(String, Vec<Revision>)>,
        tx: mpsc::Sender<FetchedRevision>,
    ) -> Result<()> {
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut queue = work.into_iter();

        loop {
            while join_set.len() >= self.config.parallelism.max(1) {
                let Some(res) = join_set.join_next().await else {
                    break;
                };
                flatten_join(res)?;
            }
            if self.cancel.is_cancelled() {
                return Err(SatchelError::Cancelled);
            }
            let Some((doc_id, missing)) = queue.next() else {
                break;
            };

            let store = self.store.clone();
            let remote = self.remote.clone();
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                if cancel.is_cancelled() {
                    return Err(SatchelError::Cancelled);
                }
                // local leaves let the peer omit attachment bodies we hold
                let atts_since = {
                    let store = store.clone();
                    let id = doc_id.clone();
                    tokio::task::spawn_blocking(move || store.leaf_revisions(&id))
                        .await
                        .map_err(|e| SatchelError::Storage(format!("fetch worker: {e}")))??
                };
                let fetched = remote.open_revs(&doc_id, &missing, &atts_since, false).await?;
                for revision in fetched {
                    if tx.send(revision).await.is_err() {
                        // insert stage went away; treat as cancellation
                        return Err(SatchelError::Cancelled);
                    }
                }
                Ok(())
            });
        }
        drop(tx);

        while let Some(res) = join_set.join_next().await {
            flatten_join(res)?;
        }
        Ok(())
    }

    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SatchelError::Cancelled),
            out = fut => out,
        }
    }
}

fn flatten_join<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    res.map_err(|e| SatchelError::Storage(format!("pipeline worker died: {e}")))?
}
