//! The store seam the migration is written against.

use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::Document;

use crate::{FieldSnapshot, SettingsUpsert, StoreError, WriteOutcome};

/// Operations the settings migration needs from a document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Ensure the unique `(node, service)` index exists on every settings collection.
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    /// Read every node document as raw BSON.
    async fn find_nodes(&self) -> Result<Vec<Document>, StoreError>;

    /// Insert or replace one settings record, keyed by node and service.
    async fn upsert_settings(&self, upsert: &SettingsUpsert) -> Result<WriteOutcome, StoreError>;

    /// Remove `field` from the nodes in `targets` whose field still holds the
    /// snapshotted value, stamping `updatedAt` on each modified node.
    ///
    /// Returns the number of node documents modified.
    async fn unset_node_field(
        &self,
        field: &str,
        targets: &[FieldSnapshot],
    ) -> Result<u64, StoreError>;

    /// Close the connection.
    async fn stop(&self) -> Result<(), StoreError>;
}

/// Opens a [`DocumentStore`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn start(&self) -> Result<Arc<dyn DocumentStore>, StoreError>;
}
