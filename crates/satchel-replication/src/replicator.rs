/// The replicator state machine.
///
/// ```text
/// Pending --start()--> Started --pipeline done--> Complete
///                      Started --stop()--> Stopping --drained--> Stopped
///                      Started/Stopping --fatal error--> Error
/// Pending --stop()--> Stopped
/// ```
///
/// `start()` from a terminal state fails; `stop()` is idempotent. Listeners
/// receive exactly one of `on_complete`, `on_stopped`, `on_error` per run.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use satchel_core::error::{Result, SatchelError};
use satchel_core::events::Event;
use satchel_core::remote::RemoteDatabase;
use satchel_sqlite::Datastore;

use crate::checkpoint::Checkpointer;
use crate::pull::PullPipeline;
use crate::push::PushPipeline;
use crate::replication_id::{Direction, replication_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Pending,
    Started,
    Stopping,
    Stopped,
    Complete,
    Error,
}

impl ReplicatorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReplicatorState::Stopped | ReplicatorState::Complete | ReplicatorState::Error
        )
    }
}

/// Counters updated as the pipelines move documents.
#[derive(Debug, Default)]
pub struct Progress {
    documents_processed: AtomicU64,
    documents_written: AtomicU64,
    batches_completed: AtomicU64,
}

impl Progress {
    pub fn documents_processed(&self) -> u64 {
        self.documents_processed.load(Ordering::SeqCst)
    }

    pub fn documents_written(&self) -> u64 {
        self.documents_written.load(Ordering::SeqCst)
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn add_processed(&self, n: u64) {
        self.documents_processed.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.documents_written.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn batch_completed(&self) {
        self.batches_completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Terminal-outcome callbacks. Invoked on the worker that finished the run;
/// implementations must not block.
pub trait ReplicationListener: Send + Sync {
    fn on_complete(&self, _progress: &Progress) {}
    fn on_stopped(&self, _progress: &Progress) {}
    fn on_error(&self, _error: &SatchelError) {}
}

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Changes fetched per batch.
    pub batch_limit: u64,
    /// Document ids per `revs_diff` request.
    pub revs_diff_chunk: usize,
    /// Concurrent fetchers (pull) or writers (push).
    pub parallelism: usize,
    /// Attachment payloads up to this size ship inline as base64; larger
    /// ones go multipart.
    pub inline_attachment_threshold: usize,
    /// Opaque filter configuration, folded into the replication id.
    pub filter: Option<serde_json::Value>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            batch_limit: 500,
            revs_diff_chunk: 25,
            parallelism: 4,
            inline_attachment_threshold: 64 * 1024,
            filter: None,
        }
    }
}

struct Inner {
    direction: Direction,
    store: Arc<Datastore>,
    remote: Arc<dyn RemoteDatabase>,
    config: ReplicatorConfig,
    replication_id: String,
    state: Mutex<ReplicatorState>,
    state_tx: watch::Sender<ReplicatorState>,
    cancel: CancellationToken,
    listeners: Mutex<Vec<Arc<dyn ReplicationListener>>>,
    progress: Arc<Progress>,
}

/// One replication run between a local store and a remote endpoint.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    pub fn new(
        store: Arc<Datastore>,
        remote: Arc<dyn RemoteDatabase>,
        direction: Direction,
        config: ReplicatorConfig,
    ) -> Self {
        let (source, target) = match direction {
            Direction::Push => (store.location().to_string(), remote.url()),
            Direction::Pull => (remote.url(), store.location().to_string()),
        };
        let replication_id = replication_id(&source, &target, config.filter.as_ref(), direction);
        let (state_tx, _) = watch::channel(ReplicatorState::Pending);

        Replicator {
            inner: Arc::new(Inner {
                direction,
                store,
                remote,
                config,
                replication_id,
                state: Mutex::new(ReplicatorState::Pending),
                state_tx,
                cancel: CancellationToken::new(),
                listeners: Mutex::new(Vec::new()),
                progress: Arc::new(Progress::default()),
            }),
        }
    }

    pub fn replication_id(&self) -> &str {
        &self.inner.replication_id
    }

    pub fn state(&self) -> ReplicatorState {
        *self.inner.state.lock().expect("replicator lock poisoned")
    }

    pub fn progress(&self) -> Arc<Progress> {
        self.inner.progress.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ReplicationListener>) {
        self.inner
            .listeners
            .lock()
            .expect("replicator lock poisoned")
            .push(listener);
    }

    /// Begin the run on the tokio runtime. Fails with `IllegalState` unless
    /// the replicator is still `Pending`.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("replicator lock poisoned");
            if *state != ReplicatorState::Pending {
                return Err(SatchelError::IllegalState(format!(
                    "cannot start replicator in state {:?}",
                    *state
                )));
            }
            *state = ReplicatorState::Started;
            self.inner.state_tx.send_replace(ReplicatorState::Started);
        }

        tracing::info!(
            replication_id = %self.inner.replication_id,
            direction = self.inner.direction.as_str(),
            "replication started"
        );
        self.inner.store.events().post(Event::ReplicationStarted {
            replication_id: self.inner.replication_id.clone(),
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = run_pipeline(&inner).await;
            finish(&inner, result);
        });
        Ok(())
    }

    /// Request a cooperative stop. Idempotent; from `Pending` the run goes
    /// straight to `Stopped`.
    pub fn stop(&self) {
        let notify_stopped = {
            let mut state = self.inner.state.lock().expect("replicator lock poisoned");
            match *state {
                ReplicatorState::Pending => {
                    *state = ReplicatorState::Stopped;
                    self.inner.state_tx.send_replace(ReplicatorState::Stopped);
                    true
                }
                ReplicatorState::Started => {
                    *state = ReplicatorState::Stopping;
                    self.inner.state_tx.send_replace(ReplicatorState::Stopping);
                    self.inner.cancel.cancel();
                    false
                }
                _ => false,
            }
        };

        if notify_stopped {
            for listener in self.listeners() {
                listener.on_stopped(&self.inner.progress);
            }
        }
    }

    /// Block until the run reaches a terminal state.
    pub async fn wait(&self) -> ReplicatorState {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ReplicationListener>> {
        self.inner
            .listeners
            .lock()
            .expect("replicator lock poisoned")
            .clone()
    }
}

async fn run_pipeline(inner: &Arc<Inner>) -> Result<()> {
    // ping the endpoint first: a missing database or bad URL fails the run
    // before any pipeline work starts
    let info = inner.remote.db_info().await?;
    tracing::debug!(
        remote = %info.db_name,
        update_seq = %info.update_seq,
        "remote endpoint verified"
    );

    let checkpoints = Checkpointer::new(inner.remote.clone(), inner.replication_id.clone());
    match inner.direction {
        Direction::Pull => {
            PullPipeline {
                store: inner.store.clone(),
                remote: inner.remote.clone(),
                config: inner.config.clone(),
                cancel: inner.cancel.clone(),
                progress: inner.progress.clone(),
                checkpoints,
            }
            .run()
            .await
        }
        Direction::Push => {
            PushPipeline {
                store: inner.store.clone(),
                remote: inner.remote.clone(),
                config: inner.config.clone(),
                cancel: inner.cancel.clone(),
                progress: inner.progress.clone(),
                checkpoints,
            }
            .run()
            .await
        }
    }
}

fn finish(inner: &Arc<Inner>, result: Result<()>) {
    let final_state = {
        let mut state = inner.state.lock().expect("replicator lock poisoned");
        let stopping = *state == ReplicatorState::Stopping;
        *state = match &result {
            Ok(()) if stopping => ReplicatorState::Stopped,
            Ok(()) => ReplicatorState::Complete,
            Err(SatchelError::Cancelled) => ReplicatorState::Stopped,
            Err(_) => ReplicatorState::Error,
        };
        *state
    };

    let listeners = inner
        .listeners
        .lock()
        .expect("replicator lock poisoned")
        .clone();
    match (&result, final_state) {
        (_, ReplicatorState::Stopped) => {
            tracing::info!(replication_id = %inner.replication_id, "replication stopped");
            for listener in &listeners {
                listener.on_stopped(&inner.progress);
            }
        }
        (Ok(()), _) => {
            tracing::info!(
                replication_id = %inner.replication_id,
                documents_written = inner.progress.documents_written(),
                "replication complete"
            );
            inner.store.events().post(Event::ReplicationCompleted {
                replication_id: inner.replication_id.clone(),
                documents_written: inner.progress.documents_written(),
            });
            for listener in &listeners {
                listener.on_complete(&inner.progress);
            }
        }
        (Err(error), _) => {
            tracing::warn!(replication_id = %inner.replication_id, %error, "replication failed");
            inner.store.events().post(Event::ReplicationErrored {
                replication_id: inner.replication_id.clone(),
                message: error.to_string(),
            });
            for listener in &listeners {
                listener.on_error(error);
            }
        }
    }

    inner.state_tx.send_replace(final_state);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
