/// Monotonic checkpoint management over the remote's `_local` documents.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use satchel_core::error::Result;
use satchel_core::remote::RemoteDatabase;
use satchel_core::revision::Seq;

pub struct Checkpointer {
    remote: Arc<dyn RemoteDatabase>,
    replication_id: String,
    /// Numeric floor of the last checkpoint written this run.
    high_water: AtomicU64,
}

impl Checkpointer {
    pub fn new(remote: Arc<dyn RemoteDatabase>, replication_id: String) -> Self {
        Checkpointer {
            remote,
            replication_id,
            high_water: AtomicU64::new(0),
        }
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Where the previous run left off, `0` if never replicated.
    pub async fn read(&self) -> Result<Seq> {
        let seq = self
            .remote
            .get_checkpoint(&self.replication_id)
            .await?
            .unwrap_or(Seq::START);
        self.high_water.store(seq.ordinal(), Ordering::SeqCst);
        Ok(seq)
    }

    /// Persist `seq` as the new checkpoint. Checkpoints only move forward;
    /// a stale or repeated sequence is a no-op.
    pub async fn advance(&self, seq: &Seq) -> Result<()> {
        let num = seq.ordinal();
        if num <= self.high_water.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.remote.put_checkpoint(&self.replication_id, seq).await?;
        self.high_water.store(num, Ordering::SeqCst);
        tracing::debug!(replication_id = %self.replication_id, last_seq = %seq, "checkpoint advanced");
        Ok(())
    }
}
