//! MongoDB-backed document store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, DateTime, Document, doc};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info, warn};

use crate::{
    Connector, DocumentStore, FieldSnapshot, NODE_COLLECTION, NodeId, SETTINGS_INDEX_NAME, SettingsCollection,
    SettingsUpsert, StoreConfig, StoreError, WriteOutcome, bson_now,
};

/// Connector that opens a [`MongoStore`] from a [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct MongoConnector {
    config: StoreConfig,
}

impl MongoConnector {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for MongoConnector {
    async fn start(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let store = MongoStore::connect(&self.config).await?;
        Ok(Arc::new(store))
    }
}

/// Document store talking to a MongoDB server through the native driver.
pub struct MongoStore {
    client: Client,
    db: Database,
    stopped: AtomicBool,
}

impl MongoStore {
    /// Connect and verify the server is reachable.
    #[tracing::instrument(skip(config), fields(database = %config.database))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.app_name = Some(config.app_name.clone());

        let client = Client::with_options(options)?;
        let db = client.database(&config.database);

        // The driver connects lazily; ping so a bad URI fails here
        db.run_command(doc! { "ping": 1 }).await?;
        info!("connected to document store");

        Ok(Self {
            client,
            db,
            stopped: AtomicBool::new(false),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        for collection in SettingsCollection::ALL {
            self.collection(collection.name())
                .create_index(settings_index())
                .await?;
            debug!(collection = %collection, "settings index ensured");
        }
        Ok(())
    }

    async fn find_nodes(&self) -> Result<Vec<Document>, StoreError> {
        let cursor = self.collection(NODE_COLLECTION).find(doc! {}).await?;
        let nodes: Vec<Document> = cursor.try_collect().await?;
        Ok(nodes)
    }

    async fn upsert_settings(&self, upsert: &SettingsUpsert) -> Result<WriteOutcome, StoreError> {
        let result = self
            .collection(upsert.collection.name())
            .update_one(
                settings_filter(&upsert.node, &upsert.service),
                settings_update(&upsert.config, bson_now()),
            )
            .upsert(true)
            .await?;

        Ok(if result.upserted_id.is_some() {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Updated
        })
    }

    async fn unset_node_field(
        &self,
        field: &str,
        targets: &[FieldSnapshot],
    ) -> Result<u64, StoreError> {
        if targets.is_empty() {
            debug!(field, "no nodes to purge");
            return Ok(0);
        }
        let result = self
            .collection(NODE_COLLECTION)
            .update_many(purge_filter(field, targets), purge_update(field, bson_now()))
            .await?;
        debug!(
            field,
            targets = targets.len(),
            matched = result.matched_count,
            modified = result.modified_count,
            "bulk unset applied"
        );
        Ok(result.modified_count)
    }

    async fn stop(&self) -> Result<(), StoreError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            warn!("document store already stopped");
            return Ok(());
        }
        self.client.clone().shutdown().await;
        info!("document store connection closed");
        Ok(())
    }
}

/// Unique `(node, service)` index used by the settings upserts.
pub fn settings_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "node": 1, "service": 1 })
        .options(
            IndexOptions::builder()
                .name(SETTINGS_INDEX_NAME.to_string())
                .unique(true)
                .build(),
        )
        .build()
}

/// Filter selecting the settings record for one node and service.
pub fn settings_filter(node: &NodeId, service: &str) -> Document {
    doc! {
        "node": node.as_bson().clone(),
        "service": service,
    }
}

/// Update document for a settings upsert.
///
/// The filter's equality fields (`node`, `service`) are copied into the
/// record by the server when the upsert inserts.
pub fn settings_update(config: &Document, now: DateTime) -> Document {
    doc! {
        "$set": { "config": config.clone(), "updatedAt": now },
        "$setOnInsert": { "createdAt": now },
    }
}

/// Filter matching each target node whose field still holds the scanned value.
pub fn purge_filter(field: &str, targets: &[FieldSnapshot]) -> Document {
    let clauses: Vec<Bson> = targets
        .iter()
        .map(|target| {
            Bson::Document(doc! {
                "_id": target.node.as_bson().clone(),
                field: { "$eq": target.value.clone() },
            })
        })
        .collect();
    doc! { "$or": clauses }
}

/// Update stamping `updatedAt` and removing `field`.
pub fn purge_update(field: &str, now: DateTime) -> Document {
    doc! {
        "$set": { "updatedAt": now },
        "$unset": { field: "" },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_settings_filter_keeps_raw_id() {
        let oid = ObjectId::new();
        let filter = settings_filter(&NodeId::new(oid), "ipmi-obm-service");
        assert_eq!(
            filter,
            doc! { "node": oid, "service": "ipmi-obm-service" }
        );
    }

    #[test]
    fn test_settings_update_shape() {
        let now = DateTime::from_millis(1_700_000_000_000);
        let config = doc! { "host": "10.1.1.2", "user": "admin" };
        let update = settings_update(&config, now);
        assert_eq!(
            update,
            doc! {
                "$set": { "config": { "host": "10.1.1.2", "user": "admin" }, "updatedAt": now },
                "$setOnInsert": { "createdAt": now },
            }
        );
    }

    #[test]
    fn test_purge_filter_pins_scanned_values() {
        let oid = ObjectId::new();
        let targets = vec![
            FieldSnapshot {
                node: NodeId::new(oid),
                value: Bson::Document(doc! { "host": "10.1.2.3" }),
            },
            FieldSnapshot {
                node: NodeId::new("node-b"),
                value: Bson::Array(vec![]),
            },
        ];
        assert_eq!(
            purge_filter("sshSettings", &targets),
            doc! {
                "$or": [
                    { "_id": oid, "sshSettings": { "$eq": { "host": "10.1.2.3" } } },
                    { "_id": "node-b", "sshSettings": { "$eq": [] } },
                ],
            }
        );
    }

    #[test]
    fn test_purge_update_shape() {
        let now = DateTime::from_millis(1_700_000_000_000);
        assert_eq!(
            purge_update("snmpSettings", now),
            doc! {
                "$set": { "updatedAt": now },
                "$unset": { "snmpSettings": "" },
            }
        );
    }

    #[test]
    fn test_settings_index_is_unique() {
        let index = settings_index();
        assert_eq!(index.keys, doc! { "node": 1, "service": 1 });
        let options = index.options.expect("index options");
        assert_eq!(options.unique, Some(true));
        assert_eq!(options.name.as_deref(), Some(SETTINGS_INDEX_NAME));
    }
}
