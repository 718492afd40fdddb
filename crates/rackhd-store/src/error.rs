//! Error types for the document store.

use thiserror::Error;

/// Errors that can occur when talking to the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Driver or server error.
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// An upsert was attempted before the settings indexes were ensured.
    #[error("indexes not ensured on collection {0}")]
    IndexesMissing(String),

    /// Fault injected by the in-memory store.
    #[error("injected fault: {0}")]
    Injected(String),
}
