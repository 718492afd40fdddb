//! Document store access for RackHD node settings.
//!
//! This crate provides the connection layer the settings migration runs
//! against: a MongoDB-backed store for real datastores and an in-memory
//! store for rehearsals and tests, both behind the [`DocumentStore`] trait.
//!
//! ## Features
//!
//! - **Native reads**: raw node documents, bypassing any typed schema
//! - **Keyed upserts**: settings records keyed by `(node, service)`
//! - **Bulk field removal**: one multi-document `$unset` per legacy field
//! - **Fault injection**: the in-memory store can fail scans, upserts and purges

mod error;
pub mod memory;
pub mod mongo;
mod store;
mod types;

pub use error::StoreError;
pub use memory::{MemoryStore, StoreEvent};
pub use mongo::{MongoConnector, MongoStore};
pub use store::{Connector, DocumentStore};
pub use types::*;

pub use mongodb::bson;
