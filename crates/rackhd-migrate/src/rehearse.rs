//! Rehearsal runs against an exported copy of the `nodes` collection.
//!
//! The export may be a JSON array or one document per line, in MongoDB
//! extended JSON as written by `mongoexport`. The full pipeline runs against
//! an in-memory store seeded from it, and the resulting collections can be
//! written back out for inspection.

use std::path::Path;
use std::sync::Arc;

use rackhd_store::bson::{Bson, Document};
use rackhd_store::{MemoryStore, SettingsCollection};
use serde_json::Value;
use tracing::info;

use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::pipeline::{MigrationReport, Migrator};

/// Parse node documents from extended JSON text.
pub fn parse_nodes(text: &str) -> Result<Vec<Document>, MigrationError> {
    let trimmed = text.trim_start();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| MigrationError::Config(format!("invalid node export: {}", e)))?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    MigrationError::Config(format!("invalid node export line {}: {}", n + 1, e))
                })
            })
            .collect::<Result<_, _>>()?
    };

    values
        .into_iter()
        .enumerate()
        .map(|(n, value)| match Bson::try_from(value) {
            Ok(Bson::Document(doc)) => Ok(doc),
            Ok(other) => Err(MigrationError::Config(format!(
                "node export entry {} is not a document: {:?}",
                n,
                other.element_type()
            ))),
            Err(e) => Err(MigrationError::Config(format!(
                "node export entry {}: {}",
                n, e
            ))),
        })
        .collect()
}

/// Read node documents from an export file.
pub async fn load_nodes(path: &Path) -> Result<Vec<Document>, MigrationError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| MigrationError::File {
            path: path.display().to_string(),
            source,
        })?;
    parse_nodes(&text)
}

/// Run the full pipeline against an in-memory copy of the exported nodes.
///
/// The dump stage is always skipped: there is no database to back up.
pub async fn rehearse(
    nodes: Vec<Document>,
    mut config: MigrationConfig,
) -> Result<(MigrationReport, Arc<MemoryStore>), MigrationError> {
    config.backup.enabled = false;
    let store = Arc::new(MemoryStore::with_nodes(nodes));
    let report = Migrator::new(Arc::clone(&store), config).run().await?;
    Ok((report, store))
}

/// Resulting collections as relaxed extended JSON.
pub async fn snapshot(store: &MemoryStore) -> Value {
    fn to_json(docs: Vec<Document>) -> Value {
        Value::Array(
            docs.into_iter()
                .map(|doc| Bson::Document(doc).into_relaxed_extjson())
                .collect(),
        )
    }

    let mut out = serde_json::Map::new();
    out.insert("nodes".to_string(), to_json(store.nodes().await));
    for collection in SettingsCollection::ALL {
        out.insert(
            collection.name().to_string(),
            to_json(store.settings(collection).await),
        );
    }
    Value::Object(out)
}

/// Write the resulting collections to `path`.
pub async fn write_snapshot(store: &MemoryStore, path: &Path) -> Result<(), MigrationError> {
    let json = serde_json::to_string_pretty(&snapshot(store).await)
        .map_err(|e| MigrationError::Config(format!("failed to encode snapshot: {}", e)))?;
    tokio::fs::write(path, json)
        .await
        .map_err(|source| MigrationError::File {
            path: path.display().to_string(),
            source,
        })?;
    info!(path = %path.display(), "rehearsal snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rackhd_store::bson::oid::ObjectId;

    #[test]
    fn test_parse_json_lines_with_object_ids() {
        let text = r#"
{"_id": {"$oid": "5a1b2c3d4e5f607182930a1b"}, "sshSettings": {"host": "h"}}

{"_id": "plain-id", "name": "n"}
"#;
        let nodes = parse_nodes(text).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(
            nodes[0].get_object_id("_id").unwrap(),
            ObjectId::parse_str("5a1b2c3d4e5f607182930a1b").unwrap()
        );
        assert_eq!(nodes[1].get_str("_id").unwrap(), "plain-id");
    }

    #[test]
    fn test_parse_json_array() {
        let text = r#"[{"_id": "a"}, {"_id": "b", "obmSettings": []}]"#;
        let nodes = parse_nodes(text).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[1].get_array("obmSettings").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_documents() {
        assert!(parse_nodes("[1, 2]").is_err());
        assert!(parse_nodes("{not json}").is_err());
    }
}
