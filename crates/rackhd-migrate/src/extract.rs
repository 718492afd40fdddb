//! Settings extraction from legacy node documents.
//!
//! Each legacy field is first decoded into a [`LegacySettings`] variant and
//! units are produced by branching on that variant. Extraction is pure and
//! never touches the source document.

use std::collections::HashMap;
use std::fmt;

use rackhd_store::bson::{Bson, Document};
use rackhd_store::{FieldSnapshot, NodeId, SettingsCollection, SettingsUpsert};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A kind of embedded settings block, migrated one kind at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsKind {
    /// Out-of-band power management, a list of `{ service, config }` entries.
    Obm,
    /// Remote console access, a single block.
    Ssh,
    /// Monitoring protocol credentials, a single block.
    Snmp,
}

impl SettingsKind {
    /// Migration order.
    pub const ALL: [SettingsKind; 3] = [SettingsKind::Obm, SettingsKind::Ssh, SettingsKind::Snmp];

    /// Name of the embedded field on node documents.
    pub fn legacy_field(&self) -> &'static str {
        match self {
            SettingsKind::Obm => "obmSettings",
            SettingsKind::Ssh => "sshSettings",
            SettingsKind::Snmp => "snmpSettings",
        }
    }

    /// Collection the settings move to.
    pub fn collection(&self) -> SettingsCollection {
        match self {
            SettingsKind::Obm => SettingsCollection::Obms,
            SettingsKind::Ssh | SettingsKind::Snmp => SettingsCollection::Ibms,
        }
    }

    /// Fixed service discriminator for single-block kinds.
    pub fn service(&self) -> Option<&'static str> {
        match self {
            SettingsKind::Obm => None,
            SettingsKind::Ssh => Some("ssh"),
            SettingsKind::Snmp => Some("snmp"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsKind::Obm => "obm",
            SettingsKind::Ssh => "ssh",
            SettingsKind::Snmp => "snmp",
        }
    }
}

impl fmt::Display for SettingsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A legacy field decoded by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacySettings {
    /// Field missing or null.
    Absent,
    /// An ordered sequence of entries.
    Sequence(Vec<Bson>),
    /// A single settings block.
    Single(Document),
    /// Present but not a shape this kind accepts.
    Malformed(String),
}

impl LegacySettings {
    /// Decode the legacy field for `kind` from a node document.
    pub fn decode(doc: &Document, kind: SettingsKind) -> Self {
        let value = match doc.get(kind.legacy_field()) {
            None | Some(Bson::Null) => return LegacySettings::Absent,
            Some(value) => value,
        };

        match (kind, value) {
            (SettingsKind::Obm, Bson::Array(entries)) => LegacySettings::Sequence(entries.clone()),
            (SettingsKind::Ssh | SettingsKind::Snmp, Bson::Document(block)) => {
                LegacySettings::Single(block.clone())
            }
            (SettingsKind::Obm, other) => {
                LegacySettings::Malformed(format!("expected an array, found {:?}", other.element_type()))
            }
            (_, other) => {
                LegacySettings::Malformed(format!("expected a document, found {:?}", other.element_type()))
            }
        }
    }
}

/// One settings record to be written to its target collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsUnit {
    pub kind: SettingsKind,
    pub node: NodeId,
    pub service: String,
    pub config: Document,
}

impl SettingsUnit {
    pub fn into_upsert(self) -> SettingsUpsert {
        SettingsUpsert {
            collection: self.kind.collection(),
            node: self.node,
            service: self.service,
            config: self.config,
        }
    }
}

/// A settings block that could not be turned into a unit.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} settings on node {node}: {reason}")]
pub struct ExtractError {
    pub kind: SettingsKind,
    pub node: NodeId,
    pub reason: String,
}

/// Extract every settings unit of `kind` from a node document.
///
/// Returns `None` for documents without an `_id`; such a document cannot be
/// keyed and is left for the caller to report.
pub fn extract(doc: &Document, kind: SettingsKind) -> Option<Vec<Result<SettingsUnit, ExtractError>>> {
    let node = NodeId::from_document(doc)?;

    let reject = |reason: String| ExtractError {
        kind,
        node: node.clone(),
        reason,
    };

    let units = match LegacySettings::decode(doc, kind) {
        LegacySettings::Absent => Vec::new(),
        LegacySettings::Malformed(reason) => vec![Err(reject(reason))],
        LegacySettings::Sequence(entries) => {
            let mut first_seen: HashMap<String, usize> = HashMap::new();
            entries
                .iter()
                .enumerate()
                .map(|(index, entry)| {
                    let (service, config) =
                        obm_entry(entry).map_err(|reason| reject(format!("entry {}: {}", index, reason)))?;
                    // One record per (node, service)
                    if let Some(first) = first_seen.get(&service) {
                        return Err(reject(format!(
                            "entry {}: duplicate service {} (first at entry {})",
                            index, service, first
                        )));
                    }
                    first_seen.insert(service.clone(), index);
                    Ok(SettingsUnit {
                        kind,
                        node: node.clone(),
                        service,
                        config,
                    })
                })
                .collect()
        }
        LegacySettings::Single(block) => {
            // Single-block kinds always carry a fixed discriminator
            let service = kind.service().unwrap_or(kind.as_str());
            vec![Ok(SettingsUnit {
                kind,
                node: node.clone(),
                service: service.to_string(),
                config: block,
            })]
        }
    };

    Some(units)
}

/// Every unit of one kind across the scanned nodes, together with the legacy
/// field values they were read from.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsBatch {
    pub kind: SettingsKind,
    /// Scanned nodes carrying the legacy field, with the value seen.
    pub sources: Vec<FieldSnapshot>,
    pub units: Vec<Result<SettingsUnit, ExtractError>>,
}

impl SettingsBatch {
    /// Extract every unit of `kind` from scanned node documents.
    pub fn collect(nodes: &[Document], kind: SettingsKind) -> Self {
        let mut sources = Vec::new();
        let mut units = Vec::new();
        for doc in nodes {
            let Some(extracted) = extract(doc, kind) else {
                continue;
            };
            if let Some(snapshot) = FieldSnapshot::capture(doc, kind.legacy_field()) {
                sources.push(snapshot);
            }
            units.extend(extracted);
        }
        Self {
            kind,
            sources,
            units,
        }
    }
}

/// Split an OBM entry into its service name and config block.
fn obm_entry(entry: &Bson) -> Result<(String, Document), String> {
    let Bson::Document(entry) = entry else {
        return Err(format!("expected a document, found {:?}", entry.element_type()));
    };
    let service = match entry.get("service") {
        Some(Bson::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => return Err("service is not a non-empty string".to_string()),
        None => return Err("missing service".to_string()),
    };
    let config = match entry.get("config") {
        Some(Bson::Document(config)) => config.clone(),
        Some(_) => return Err("config is not a document".to_string()),
        None => return Err("missing config".to_string()),
    };
    Ok((service, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rackhd_store::bson::doc;

    fn ok_units(units: Vec<Result<SettingsUnit, ExtractError>>) -> Vec<SettingsUnit> {
        units.into_iter().map(|u| u.unwrap()).collect()
    }

    #[test]
    fn test_obm_sequence_yields_one_unit_per_entry() {
        let node = doc! {
            "_id": "node-a",
            "obmSettings": [
                { "service": "ipmi-obm-service", "config": { "host": "10.0.0.1", "user": "admin" } },
                { "service": "redfish-obm-service", "config": { "uri": "https://10.0.0.2" } },
            ],
        };

        let units = ok_units(extract(&node, SettingsKind::Obm).unwrap());
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].service, "ipmi-obm-service");
        assert_eq!(units[0].config, doc! { "host": "10.0.0.1", "user": "admin" });
        assert_eq!(units[1].service, "redfish-obm-service");
        assert!(units.iter().all(|u| u.node == NodeId::new("node-a")));
    }

    #[test]
    fn test_single_blocks_get_fixed_discriminators() {
        let node = doc! {
            "_id": "node-b",
            "sshSettings": { "host": "10.0.0.5", "user": "root", "password": "pw" },
            "snmpSettings": { "host": "10.0.0.5", "community": "public" },
        };

        let ssh = ok_units(extract(&node, SettingsKind::Ssh).unwrap());
        assert_eq!(ssh.len(), 1);
        assert_eq!(ssh[0].service, "ssh");
        assert_eq!(
            ssh[0].config,
            doc! { "host": "10.0.0.5", "user": "root", "password": "pw" }
        );

        let snmp = ok_units(extract(&node, SettingsKind::Snmp).unwrap());
        assert_eq!(snmp.len(), 1);
        assert_eq!(snmp[0].service, "snmp");
        assert_eq!(snmp[0].clone().into_upsert().collection, SettingsCollection::Ibms);
    }

    #[test]
    fn test_absent_null_and_empty_yield_nothing() {
        let node = doc! { "_id": "c", "obmSettings": [], "sshSettings": Bson::Null };
        assert!(extract(&node, SettingsKind::Obm).unwrap().is_empty());
        assert!(extract(&node, SettingsKind::Ssh).unwrap().is_empty());
        assert!(extract(&node, SettingsKind::Snmp).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_shapes_are_rejected() {
        let node = doc! {
            "_id": "d",
            "obmSettings": { "service": "ipmi-obm-service" },
            "sshSettings": "root@host",
        };

        let obm = extract(&node, SettingsKind::Obm).unwrap();
        assert_eq!(obm.len(), 1);
        assert!(obm[0].is_err());

        let ssh = extract(&node, SettingsKind::Ssh).unwrap();
        assert_eq!(ssh.len(), 1);
        let err = ssh[0].clone().unwrap_err();
        assert_eq!(err.kind, SettingsKind::Ssh);
        assert_eq!(err.node, NodeId::new("d"));
    }

    #[test]
    fn test_bad_obm_entry_rejected_alongside_good_ones() {
        let node = doc! {
            "_id": "e",
            "obmSettings": [
                { "service": "ipmi-obm-service", "config": { "host": "h" } },
                { "config": { "host": "h" } },
                "garbage",
            ],
        };

        let units = extract(&node, SettingsKind::Obm).unwrap();
        assert_eq!(units.len(), 3);
        assert!(units[0].is_ok());
        assert!(units[1].as_ref().unwrap_err().reason.contains("missing service"));
        assert!(units[2].as_ref().unwrap_err().reason.starts_with("entry 2"));
    }

    #[test]
    fn test_duplicate_obm_service_rejected() {
        let node = doc! {
            "_id": "dup",
            "obmSettings": [
                { "service": "ipmi-obm-service", "config": { "host": "first" } },
                { "service": "redfish-obm-service", "config": { "host": "other" } },
                { "service": "ipmi-obm-service", "config": { "host": "second" } },
            ],
        };

        let units = extract(&node, SettingsKind::Obm).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].as_ref().unwrap().config, doc! { "host": "first" });
        assert!(units[1].is_ok());
        let err = units[2].as_ref().unwrap_err();
        assert_eq!(err.node, NodeId::new("dup"));
        assert!(err.reason.contains("duplicate service ipmi-obm-service (first at entry 0)"));
    }

    #[test]
    fn test_batch_records_sources() {
        let nodes = vec![
            doc! { "_id": "a", "sshSettings": { "host": "a" } },
            doc! { "sshSettings": { "host": "unkeyed" } },
            doc! { "_id": "b", "sshSettings": "malformed" },
            doc! { "_id": "c" },
        ];

        let batch = SettingsBatch::collect(&nodes, SettingsKind::Ssh);
        assert_eq!(batch.kind, SettingsKind::Ssh);
        assert_eq!(batch.units.len(), 2);
        let sources: Vec<String> = batch.sources.iter().map(|s| s.node.to_string()).collect();
        assert_eq!(sources, vec!["a", "b"]);
        assert_eq!(batch.sources[1].value, Bson::String("malformed".to_string()));
    }

    #[test]
    fn test_document_without_id_is_skipped() {
        let node = doc! { "sshSettings": { "host": "h" } };
        assert!(extract(&node, SettingsKind::Ssh).is_none());
    }

    #[test]
    fn test_extraction_leaves_source_untouched() {
        let node = doc! {
            "_id": "f",
            "name": "rack-1",
            "obmSettings": [{ "service": "ipmi-obm-service", "config": { "host": "h" } }],
        };
        let before = node.clone();
        let _ = extract(&node, SettingsKind::Obm);
        assert_eq!(node, before);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SettingsKind::Obm.legacy_field(), "obmSettings");
        assert_eq!(SettingsKind::Ssh.legacy_field(), "sshSettings");
        assert_eq!(SettingsKind::Snmp.legacy_field(), "snmpSettings");
        assert_eq!(SettingsKind::Obm.collection(), SettingsCollection::Obms);
        assert_eq!(SettingsKind::Snmp.collection(), SettingsCollection::Ibms);
    }
}
