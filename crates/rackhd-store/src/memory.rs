//! In-memory document store.
//!
//! Holds node and settings documents behind a lock and follows the same
//! semantics as the MongoDB store: keyed upserts, existence-filtered bulk
//! unsets, and a hard failure for upserts issued before the settings indexes
//! exist. Every mutation is appended to an event log so callers can check
//! the order in which writes happened. Faults can be injected per node or per
//! field.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use mongodb::bson::{Document, doc, oid::ObjectId};
use tokio::sync::RwLock;
use tracing::trace;

use crate::{
    Connector, DocumentStore, FieldSnapshot, SettingsCollection, SettingsUpsert, StoreError, WriteOutcome,
    bson_now,
};

/// A mutation observed by the in-memory store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Settings indexes were ensured.
    IndexesEnsured,
    /// Node documents were read.
    Scanned { nodes: usize },
    /// A settings record was written.
    Upserted {
        collection: SettingsCollection,
        node: String,
        service: String,
        outcome: WriteOutcome,
    },
    /// A legacy field was removed from node documents.
    FieldUnset { field: String, modified: u64 },
    /// The connection was stopped.
    Stopped,
}

#[derive(Debug, Default)]
struct Faults {
    scan: bool,
    after_scan: Vec<Document>,
    upsert_nodes: HashSet<String>,
    unset_fields: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    nodes: Vec<Document>,
    obms: Vec<Document>,
    ibms: Vec<Document>,
    indexes_ready: bool,
    events: Vec<StoreEvent>,
    faults: Faults,
}

impl State {
    fn settings(&self, collection: SettingsCollection) -> &Vec<Document> {
        match collection {
            SettingsCollection::Obms => &self.obms,
            SettingsCollection::Ibms => &self.ibms,
        }
    }

    fn settings_mut(&mut self, collection: SettingsCollection) -> &mut Vec<Document> {
        match collection {
            SettingsCollection::Obms => &mut self.obms,
            SettingsCollection::Ibms => &mut self.ibms,
        }
    }
}

/// Document store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    stop_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with node documents.
    pub fn with_nodes(nodes: Vec<Document>) -> Self {
        Self {
            state: RwLock::new(State {
                nodes,
                ..State::default()
            }),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub async fn insert_node(&self, node: Document) {
        self.state.write().await.nodes.push(node);
    }

    /// Make the next node scans fail.
    pub async fn fail_scan(&self) {
        self.state.write().await.faults.scan = true;
    }

    /// Write `node` right after the next scan returns, as a concurrent writer
    /// would. Replaces the node with the same `_id`, or inserts it.
    pub async fn write_after_scan(&self, node: Document) {
        self.state.write().await.faults.after_scan.push(node);
    }

    /// Make every upsert for the given node id fail.
    pub async fn fail_upserts_for(&self, node: &str) {
        self.state
            .write()
            .await
            .faults
            .upsert_nodes
            .insert(node.to_string());
    }

    /// Make bulk removal of the given field fail.
    pub async fn fail_unset_of(&self, field: &str) {
        self.state
            .write()
            .await
            .faults
            .unset_fields
            .insert(field.to_string());
    }

    pub async fn clear_faults(&self) {
        self.state.write().await.faults = Faults::default();
    }

    /// Snapshot of all node documents.
    pub async fn nodes(&self) -> Vec<Document> {
        self.state.read().await.nodes.clone()
    }

    /// Node document whose `_id` displays as `id`.
    pub async fn node(&self, id: &str) -> Option<Document> {
        self.state
            .read()
            .await
            .nodes
            .iter()
            .find(|n| display_id(n).as_deref() == Some(id))
            .cloned()
    }

    /// Snapshot of a settings collection.
    pub async fn settings(&self, collection: SettingsCollection) -> Vec<Document> {
        self.state.read().await.settings(collection).clone()
    }

    /// Settings records of one collection belonging to the node displayed as `node`.
    pub async fn settings_for(&self, collection: SettingsCollection, node: &str) -> Vec<Document> {
        self.state
            .read()
            .await
            .settings(collection)
            .iter()
            .filter(|r| {
                r.get("node")
                    .map(|n| crate::NodeId::new(n.clone()).to_string())
                    .as_deref()
                    == Some(node)
            })
            .cloned()
            .collect()
    }

    /// Every mutation observed so far, in order.
    pub async fn events(&self) -> Vec<StoreEvent> {
        self.state.read().await.events.clone()
    }

    /// How many times `stop` has been called.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

fn display_id(doc: &Document) -> Option<String> {
    crate::NodeId::from_document(doc).map(|id| id.to_string())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.indexes_ready = true;
        state.events.push(StoreEvent::IndexesEnsured);
        Ok(())
    }

    async fn find_nodes(&self) -> Result<Vec<Document>, StoreError> {
        let mut state = self.state.write().await;
        if state.faults.scan {
            return Err(StoreError::Injected("node scan".to_string()));
        }
        let nodes = state.nodes.clone();
        state.events.push(StoreEvent::Scanned { nodes: nodes.len() });

        let late = std::mem::take(&mut state.faults.after_scan);
        for node in late {
            let id = node.get("_id").cloned();
            match state.nodes.iter_mut().find(|n| n.get("_id") == id.as_ref()) {
                Some(existing) => *existing = node,
                None => state.nodes.push(node),
            }
        }
        Ok(nodes)
    }

    async fn upsert_settings(&self, upsert: &SettingsUpsert) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.write().await;
        if !state.indexes_ready {
            return Err(StoreError::IndexesMissing(upsert.collection.to_string()));
        }

        let node_key = upsert.node.to_string();
        if state.faults.upsert_nodes.contains(&node_key) {
            return Err(StoreError::Injected(format!("upsert for node {}", node_key)));
        }

        let now = bson_now();
        let records = state.settings_mut(upsert.collection);
        let existing = records.iter_mut().find(|r| {
            r.get("node") == Some(upsert.node.as_bson())
                && r.get_str("service").ok() == Some(upsert.service.as_str())
        });

        let outcome = match existing {
            Some(record) => {
                record.insert("config", upsert.config.clone());
                record.insert("updatedAt", now);
                WriteOutcome::Updated
            }
            None => {
                records.push(doc! {
                    "_id": ObjectId::new(),
                    "node": upsert.node.as_bson().clone(),
                    "service": upsert.service.as_str(),
                    "config": upsert.config.clone(),
                    "createdAt": now,
                    "updatedAt": now,
                });
                WriteOutcome::Inserted
            }
        };

        trace!(node = %node_key, service = %upsert.service, ?outcome, "memory upsert");
        state.events.push(StoreEvent::Upserted {
            collection: upsert.collection,
            node: node_key,
            service: upsert.service.clone(),
            outcome,
        });
        Ok(outcome)
    }

    async fn unset_node_field(
        &self,
        field: &str,
        targets: &[FieldSnapshot],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        if state.faults.unset_fields.contains(field) {
            return Err(StoreError::Injected(format!("unset of {}", field)));
        }

        let now = bson_now();
        let mut modified = 0;
        for node in state.nodes.iter_mut() {
            let matches = targets.iter().any(|target| {
                node.get("_id") == Some(target.node.as_bson())
                    && node.get(field) == Some(&target.value)
            });
            if !matches {
                continue;
            }
            node.remove(field);
            node.insert("updatedAt", now);
            modified += 1;
        }

        state.events.push(StoreEvent::FieldUnset {
            field: field.to_string(),
            modified,
        });
        Ok(modified)
    }

    async fn stop(&self) -> Result<(), StoreError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.state.write().await.events.push(StoreEvent::Stopped);
        Ok(())
    }
}

#[async_trait]
impl Connector for Arc<MemoryStore> {
    async fn start(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::clone(self) as Arc<dyn DocumentStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    fn upsert(node: &str, service: &str, host: &str) -> SettingsUpsert {
        SettingsUpsert {
            collection: SettingsCollection::Obms,
            node: NodeId::new(node),
            service: service.to_string(),
            config: doc! { "host": host },
        }
    }

    #[tokio::test]
    async fn test_upsert_requires_indexes() {
        let store = MemoryStore::new();
        let result = store.upsert_settings(&upsert("a", "ipmi", "h1")).await;
        assert!(matches!(result, Err(StoreError::IndexesMissing(_))));
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let store = MemoryStore::new();
        store.ensure_indexes().await.unwrap();

        let first = store.upsert_settings(&upsert("a", "ipmi", "h1")).await.unwrap();
        let second = store.upsert_settings(&upsert("a", "ipmi", "h2")).await.unwrap();
        let other = store.upsert_settings(&upsert("a", "redfish", "h3")).await.unwrap();

        assert_eq!(first, WriteOutcome::Inserted);
        assert_eq!(second, WriteOutcome::Updated);
        assert_eq!(other, WriteOutcome::Inserted);

        let records = store.settings_for(SettingsCollection::Obms, "a").await;
        assert_eq!(records.len(), 2);
        let ipmi = records
            .iter()
            .find(|r| r.get_str("service").unwrap() == "ipmi")
            .unwrap();
        assert_eq!(ipmi.get_document("config").unwrap(), &doc! { "host": "h2" });
    }

    fn snapshot(doc: &Document, field: &str) -> FieldSnapshot {
        FieldSnapshot::capture(doc, field).unwrap()
    }

    #[tokio::test]
    async fn test_unset_only_touches_matching_targets() {
        let a = doc! { "_id": "a", "obmSettings": [] };
        let b = doc! { "_id": "b", "obmSettings": [] };
        let store = MemoryStore::with_nodes(vec![
            a.clone(),
            b.clone(),
            doc! { "_id": "c", "name": "plain" },
        ]);

        let modified = store
            .unset_node_field("obmSettings", &[snapshot(&a, "obmSettings")])
            .await
            .unwrap();
        assert_eq!(modified, 1);

        let a = store.node("a").await.unwrap();
        assert!(!a.contains_key("obmSettings"));
        assert!(a.contains_key("updatedAt"));
        assert!(store.node("b").await.unwrap().contains_key("obmSettings"));
        assert_eq!(store.node("c").await.unwrap(), doc! { "_id": "c", "name": "plain" });

        // Duplicate targets modify a node once
        let again = store
            .unset_node_field("obmSettings", &[snapshot(&b, "obmSettings"), snapshot(&b, "obmSettings")])
            .await
            .unwrap();
        assert_eq!(again, 1);
    }

    #[tokio::test]
    async fn test_unset_skips_changed_values() {
        let scanned = doc! { "_id": "a", "sshSettings": { "host": "old" } };
        let store = MemoryStore::with_nodes(vec![scanned.clone()]);
        store
            .write_after_scan(doc! { "_id": "a", "sshSettings": { "host": "new" } })
            .await;
        store
            .write_after_scan(doc! { "_id": "late", "sshSettings": { "host": "late" } })
            .await;

        let nodes = store.find_nodes().await.unwrap();
        assert_eq!(nodes, vec![scanned.clone()]);
        assert_eq!(store.nodes().await.len(), 2);

        let modified = store
            .unset_node_field("sshSettings", &[snapshot(&scanned, "sshSettings")])
            .await
            .unwrap();
        assert_eq!(modified, 0);
        assert_eq!(
            store.node("a").await.unwrap().get_document("sshSettings").unwrap(),
            &doc! { "host": "new" }
        );
        assert!(store.node("late").await.unwrap().contains_key("sshSettings"));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::with_nodes(vec![doc! { "_id": "a" }]);
        store.ensure_indexes().await.unwrap();
        store.fail_scan().await;
        store.fail_upserts_for("a").await;
        store.fail_unset_of("sshSettings").await;

        assert!(store.find_nodes().await.is_err());
        assert!(store.upsert_settings(&upsert("a", "ipmi", "h")).await.is_err());
        assert!(store.unset_node_field("sshSettings", &[]).await.is_err());

        store.clear_faults().await;
        assert_eq!(store.find_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connector_shares_state() {
        let store = Arc::new(MemoryStore::new());
        let opened = store.start().await.unwrap();
        opened.stop().await.unwrap();
        assert_eq!(store.stop_calls(), 1);
        assert_eq!(store.events().await, vec![StoreEvent::Stopped]);
    }
}
