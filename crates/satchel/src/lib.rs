//! Satchel: an embedded document store with CouchDB replication.
//!
//! The pieces, re-exported from the workspace crates:
//!
//! - [`Datastore`] — multi-version local store over SQLite with a revision
//!   tree per document, content-addressed attachments, and a change feed.
//! - [`HttpRemote`] — the replication protocol client for a remote
//!   CouchDB-compatible database.
//! - [`Replicator`] — state-machine-driven push/pull pipelines with
//!   checkpoints, retry, and cancellation.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use satchel::{DatastoreManager, HttpRemote, replicate_push};
//!
//! # fn main() -> satchel::Result<()> {
//! let manager = DatastoreManager::open(Path::new("/tmp/satchel"))?;
//! let store = manager.datastore("notes")?;
//! store.create("note-1", serde_json::json!({"text": "hello"}), vec![])?;
//!
//! let remote = Arc::new(HttpRemote::new("http://localhost:5984/notes")?);
//! let _replicator = replicate_push(store, remote);
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use satchel_core::{
    Attachment, ChangeEvent, ChangesPage, DocumentRevision, Encoding, Event, EventListener,
    FetchedRevision, RemoteDatabase, Result, Revision, SatchelError, Seq,
};
pub use satchel_remote::{
    BasicAuthInterceptor, HttpInterceptor, HttpRemote, HttpRemoteConfig, RequestContext,
    ResponseContext, RetryPolicy,
};
pub use satchel_replication::{
    Direction, Progress, ReplicationListener, Replicator, ReplicatorConfig, ReplicatorState,
};
pub use satchel_sqlite::{Datastore, NewAttachment};

/// Opens named datastores under one root directory, one subdirectory per
/// store.
pub struct DatastoreManager {
    root: PathBuf,
}

impl DatastoreManager {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(DatastoreManager {
            root: root.to_path_buf(),
        })
    }

    /// Open (or create) the datastore called `name`.
    pub fn datastore(&self, name: &str) -> Result<Arc<Datastore>> {
        validate_name(name)?;
        Ok(Arc::new(Datastore::open(&self.root.join(name))?))
    }

    /// Delete a datastore's files. The caller is responsible for dropping
    /// any open handles first.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.root.join(name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if !ok {
        return Err(SatchelError::BadRequest(format!(
            "invalid datastore name: {name}"
        )));
    }
    Ok(())
}

/// A push replicator with default configuration.
pub fn replicate_push(store: Arc<Datastore>, remote: Arc<dyn RemoteDatabase>) -> Replicator {
    Replicator::new(store, remote, Direction::Push, ReplicatorConfig::default())
}

/// A pull replicator with default configuration.
pub fn replicate_pull(store: Arc<Datastore>, remote: Arc<dyn RemoteDatabase>) -> Replicator {
    Replicator::new(store, remote, Direction::Pull, ReplicatorConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_opens_and_lists_stores() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DatastoreManager::open(dir.path()).unwrap();

        let store = manager.datastore("notes").unwrap();
        store
            .create("n1", serde_json::json!({"text": "x"}), vec![])
            .unwrap();
        drop(store);
        manager.datastore("tasks").unwrap();

        assert_eq!(manager.list().unwrap(), vec!["notes", "tasks"]);

        manager.delete("tasks").unwrap();
        assert_eq!(manager.list().unwrap(), vec!["notes"]);
    }

    #[test]
    fn manager_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DatastoreManager::open(dir.path()).unwrap();
        assert!(manager.datastore("../escape").is_err());
        assert!(manager.datastore("").is_err());
        assert!(manager.datastore(".hidden").is_err());
    }

    #[test]
    fn reopened_store_keeps_documents() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DatastoreManager::open(dir.path()).unwrap();
        {
            let store = manager.datastore("notes").unwrap();
            store
                .create("n1", serde_json::json!({"text": "persisted"}), vec![])
                .unwrap();
        }
        let store = manager.datastore("notes").unwrap();
        assert_eq!(store.get("n1").unwrap().body["text"], "persisted");
    }
}
