//! SQLite-backed local document store for Satchel.
//!
//! A [`Datastore`] keeps one revision tree per document in a relational
//! schema, binary attachments in a content-addressed blob directory next to
//! the database file, and a monotonically increasing change feed. Writers
//! are serialized; every mutation is one transaction.

pub mod adapter;
pub mod blob;
mod revs;
pub mod schema;
pub mod store;

pub use adapter::SqlAdapter;
pub use blob::{BlobStore, sha1_hex};
pub use store::{Datastore, NewAttachment};
