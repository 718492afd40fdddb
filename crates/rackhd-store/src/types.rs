//! Core types shared by the store implementations.

use std::fmt;

use chrono::Utc;
use mongodb::bson::{Bson, DateTime, Document};
use serde::{Deserialize, Serialize};

/// Collection holding node documents.
pub const NODE_COLLECTION: &str = "nodes";

/// Collection holding out-of-band management (power control) settings.
pub const OBM_COLLECTION: &str = "obms";

/// Collection holding in-band management (ssh, snmp) settings.
pub const IBM_COLLECTION: &str = "ibms";

/// Default database name used by RackHD.
pub const DEFAULT_DATABASE: &str = "pxe";

/// Default connection string.
pub const DEFAULT_URI: &str = "mongodb://localhost:27017";

/// Name of the unique `(node, service)` index on settings collections.
pub const SETTINGS_INDEX_NAME: &str = "node_1_service_1";

/// A dedicated settings collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsCollection {
    Obms,
    Ibms,
}

impl SettingsCollection {
    pub const ALL: [SettingsCollection; 2] = [SettingsCollection::Obms, SettingsCollection::Ibms];

    /// Collection name in the database.
    pub fn name(&self) -> &'static str {
        match self {
            SettingsCollection::Obms => OBM_COLLECTION,
            SettingsCollection::Ibms => IBM_COLLECTION,
        }
    }
}

impl fmt::Display for SettingsCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of a node document.
///
/// Keeps the raw `_id` value so that foreign keys and purge filters match the
/// stored type exactly, while `Display` gives the familiar string form.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeId(Bson);

impl NodeId {
    pub fn new(raw: impl Into<Bson>) -> Self {
        Self(raw.into())
    }

    /// Read the `_id` of a node document.
    pub fn from_document(doc: &Document) -> Option<Self> {
        match doc.get("_id") {
            None | Some(Bson::Null) => None,
            Some(id) => Some(Self(id.clone())),
        }
    }

    pub fn as_bson(&self) -> &Bson {
        &self.0
    }

    pub fn into_bson(self) -> Bson {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Bson::ObjectId(oid) => write!(f, "{}", oid.to_hex()),
            Bson::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

/// A keyed insert-or-replace of one settings record.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsUpsert {
    pub collection: SettingsCollection,
    pub node: NodeId,
    pub service: String,
    pub config: Document,
}

/// A legacy field value as it was read by the node scan.
///
/// The purge only removes a field that still holds this exact value, so a
/// node added or edited after the scan keeps its settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnapshot {
    pub node: NodeId,
    pub value: Bson,
}

impl FieldSnapshot {
    /// Capture `field` from a node document, if the node is keyed and the
    /// field holds a value.
    pub fn capture(doc: &Document, field: &str) -> Option<Self> {
        let node = NodeId::from_document(doc)?;
        match doc.get(field) {
            None | Some(Bson::Null) => None,
            Some(value) => Some(Self {
                node,
                value: value.clone(),
            }),
        }
    }
}

/// Whether an upsert created a record or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOutcome {
    Inserted,
    Updated,
}

/// Connection settings for the MongoDB store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub app_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            app_name: "rackhd-migrate".to_string(),
        }
    }
}

/// Current time as a BSON date.
pub fn bson_now() -> DateTime {
    DateTime::from_millis(Utc::now().timestamp_millis())
}
