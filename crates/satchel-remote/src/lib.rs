//! CouchDB replication protocol HTTP client for Satchel.
//!
//! [`HttpRemote`] implements [`satchel_core::RemoteDatabase`] over reqwest:
//! `_changes`, `_revs_diff`, `open_revs` (multipart/mixed), `_bulk_docs`,
//! multipart/related document PUTs, and `_local` checkpoints. Calls run
//! through an interceptor chain and retry transient failures with bounded
//! exponential backoff.

pub mod client;
pub mod interceptor;
pub mod multipart;
pub mod retry;

pub use client::{HttpRemote, HttpRemoteConfig};
pub use interceptor::{BasicAuthInterceptor, HttpInterceptor, RequestContext, ResponseContext};
pub use retry::RetryPolicy;
