//! Bidirectional CouchDB-protocol replicator for Satchel.
//!
//! A [`Replicator`] drives one pull or push run between a local
//! [`satchel_sqlite::Datastore`] and a [`satchel_core::RemoteDatabase`]
//! endpoint: a state machine around staged, back-pressured pipelines with
//! cooperative cancellation, retryable I/O and monotonic checkpoints.

pub mod checkpoint;
mod pull;
mod push;
pub mod replication_id;
pub mod replicator;

pub use checkpoint::Checkpointer;
pub use replication_id::{Direction, replication_id};
pub use replicator::{
    Progress, ReplicationListener, Replicator, ReplicatorConfig, ReplicatorState,
};
