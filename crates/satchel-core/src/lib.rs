//! Core types, traits, and algorithms for Satchel.
//!
//! Everything shared between the local store, the HTTP remote and the
//! replicator lives here: revision ids and their generation, the document
//! and attachment model, the deterministic winner rule, the event bus, and
//! the [`RemoteDatabase`] trait the replicator drives.

pub mod canonical;
pub mod document;
pub mod error;
pub mod events;
pub mod remote;
pub mod revision;
pub mod winner;

pub use canonical::{canonical_json, new_rev_id};
pub use document::{
    Attachment, ChangeEvent, ChangeRev, ChangesPage, DocResult, DocumentRevision, Encoding,
    FetchedRevision, RevisionHistory, RevsDiffEntry,
};
pub use error::{Result, SatchelError};
pub use events::{Event, EventBus, EventListener};
pub use remote::{AttachmentPayload, DbInfo, RemoteDatabase};
pub use revision::{Revision, Seq};
pub use winner::{LeafRev, conflict_leaves, sort_leaves, winning_leaf};
