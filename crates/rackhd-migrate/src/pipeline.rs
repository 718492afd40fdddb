//! Migration orchestrator.
//!
//! Drives the run through a fixed sequence of stages:
//!
//! ```text
//! Bootstrap -> BackedUp -> Connected -> Scanned
//!     -> Dispatched(obm)  -> Purged(obm)
//!     -> Dispatched(ssh)  -> Purged(ssh)
//!     -> Dispatched(snmp) -> Purged(snmp)
//!     -> Stopped
//! ```
//!
//! Kinds are handled one after another and each kind's purge waits for all of
//! its upserts to settle. The store is stopped on every path once it has been
//! started.

use std::sync::Arc;

use rackhd_store::bson::Document;
use rackhd_store::{Connector, DocumentStore, NodeId};
use tracing::{info, warn};

use crate::backup::{BackupOutcome, run_backup};
use crate::config::MigrationConfig;
use crate::dispatch::{DispatchReport, UpsertDispatcher};
use crate::error::MigrationError;
use crate::extract::{SettingsBatch, SettingsKind, extract};
use crate::notify::{ChangePublisher, LogPublisher};
use crate::purge::purge_legacy_field;
use crate::secrets::SecretsCodec;

/// A point in the run's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Bootstrap,
    BackedUp,
    Connected,
    Scanned,
    Dispatched(SettingsKind),
    Purged(SettingsKind),
    Stopped,
}

/// Outcome of one settings kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindReport {
    pub dispatch: DispatchReport,
    /// Node documents the legacy field was removed from.
    pub purged: u64,
}

/// Outcome of a full run.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub backup: BackupOutcome,
    pub nodes_scanned: usize,
    /// Documents without an `_id`, which cannot be migrated.
    pub unkeyed_documents: usize,
    pub kinds: Vec<KindReport>,
    /// Stages in the order they were reached.
    pub stages: Vec<Stage>,
}

impl MigrationReport {
    pub fn kind(&self, kind: SettingsKind) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.dispatch.kind == kind)
    }

    /// Settings records written across all kinds.
    pub fn records_written(&self) -> usize {
        self.kinds.iter().map(|k| k.dispatch.written()).sum()
    }

    /// Units that were not written across all kinds.
    pub fn failures(&self) -> usize {
        self.kinds.iter().map(|k| k.dispatch.failures.len()).sum()
    }
}

/// What a run would do for one settings kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindPreview {
    pub kind: SettingsKind,
    /// Nodes carrying the legacy field.
    pub nodes: usize,
    /// Records that would be written.
    pub units: usize,
    /// Blocks that would be rejected, keeping their node's legacy field.
    pub rejected: usize,
}

/// Preview of what a run would change.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPreview {
    pub nodes_scanned: usize,
    pub kinds: Vec<KindPreview>,
    /// Human-readable descriptions of changes.
    pub changes: Vec<String>,
}

impl MigrationPreview {
    /// Build a preview from scanned node documents.
    pub fn from_nodes(nodes: &[Document]) -> Self {
        let mut kinds = Vec::new();
        let mut changes = Vec::new();

        for kind in SettingsKind::ALL {
            let mut preview = KindPreview {
                kind,
                nodes: 0,
                units: 0,
                rejected: 0,
            };

            for doc in nodes {
                let Some(units) = extract(doc, kind) else {
                    continue;
                };
                if units.is_empty() {
                    continue;
                }
                preview.nodes += 1;

                let mut services = Vec::new();
                for unit in &units {
                    match unit {
                        Ok(unit) => {
                            preview.units += 1;
                            services.push(unit.service.as_str());
                        }
                        Err(e) => {
                            preview.rejected += 1;
                            changes.push(format!("Skip: {}", e));
                        }
                    }
                }
                if !services.is_empty() {
                    let node = NodeId::from_document(doc)
                        .map(|id| id.to_string())
                        .unwrap_or_default();
                    changes.push(format!(
                        "Node {}: move {} to {} ({})",
                        node,
                        kind.legacy_field(),
                        kind.collection(),
                        services.join(", ")
                    ));
                }
            }

            kinds.push(preview);
        }

        Self {
            nodes_scanned: nodes.len(),
            kinds,
            changes,
        }
    }

    /// Records a run would write.
    pub fn records_to_write(&self) -> usize {
        self.kinds.iter().map(|k| k.units).sum()
    }
}

fn enter(stages: &mut Vec<Stage>, stage: Stage) {
    info!(stage = ?stage, "migration stage reached");
    stages.push(stage);
}

/// Runs the settings migration against a store opened by `C`.
pub struct Migrator<C> {
    connector: C,
    config: MigrationConfig,
    publisher: Arc<dyn ChangePublisher>,
}

impl<C: Connector> Migrator<C> {
    pub fn new(connector: C, config: MigrationConfig) -> Self {
        Self {
            connector,
            config,
            publisher: Arc::new(LogPublisher),
        }
    }

    /// Destination for change events when notifications are not suppressed.
    pub fn with_publisher(mut self, publisher: Arc<dyn ChangePublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Run the full migration.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        let mut stages = Vec::new();

        let codec = SecretsCodec::start(self.config.encryption_key.as_deref())?;
        enter(&mut stages, Stage::Bootstrap);

        let backup = run_backup(&self.config.backup).await?;
        enter(&mut stages, Stage::BackedUp);

        let store = self
            .connector
            .start()
            .await
            .map_err(MigrationError::Connect)?;

        let result = self.migrate(store.as_ref(), &codec, &mut stages).await;

        if let Err(e) = store.stop().await {
            warn!(error = %e, "failed to stop document store");
        }
        enter(&mut stages, Stage::Stopped);

        let (nodes_scanned, unkeyed_documents, kinds) = result?;
        let report = MigrationReport {
            backup,
            nodes_scanned,
            unkeyed_documents,
            kinds,
            stages,
        };

        info!(
            nodes = report.nodes_scanned,
            written = report.records_written(),
            failed = report.failures(),
            "migration complete"
        );
        Ok(report)
    }

    async fn migrate(
        &self,
        store: &dyn DocumentStore,
        codec: &SecretsCodec,
        stages: &mut Vec<Stage>,
    ) -> Result<(usize, usize, Vec<KindReport>), MigrationError> {
        store
            .ensure_indexes()
            .await
            .map_err(MigrationError::Indexes)?;
        enter(stages, Stage::Connected);

        let nodes = store.find_nodes().await.map_err(MigrationError::Scan)?;
        let unkeyed = nodes
            .iter()
            .filter(|doc| NodeId::from_document(doc).is_none())
            .count();
        if unkeyed > 0 {
            warn!(count = unkeyed, "skipping node documents without an _id");
        }
        info!(count = nodes.len(), "scanned node documents");
        enter(stages, Stage::Scanned);

        let dispatcher =
            UpsertDispatcher::new(store, codec, &self.config).with_publisher(self.publisher.as_ref());

        let mut kinds = Vec::with_capacity(SettingsKind::ALL.len());
        for kind in SettingsKind::ALL {
            let dispatch = dispatcher
                .dispatch(SettingsBatch::collect(&nodes, kind))
                .await;
            enter(stages, Stage::Dispatched(kind));

            let purged = purge_legacy_field(store, &dispatch).await?;
            enter(stages, Stage::Purged(kind));

            kinds.push(KindReport { dispatch, purged });
        }

        Ok((nodes.len(), unkeyed, kinds))
    }

    /// Scan and extract without writing anything.
    #[tracing::instrument(skip(self))]
    pub async fn preview(&self) -> Result<MigrationPreview, MigrationError> {
        // Nothing is sealed here; starting the codec only validates the key
        SecretsCodec::start(self.config.encryption_key.as_deref())?;

        let store = self
            .connector
            .start()
            .await
            .map_err(MigrationError::Connect)?;
        let scanned = store.find_nodes().await.map_err(MigrationError::Scan);

        if let Err(e) = store.stop().await {
            warn!(error = %e, "failed to stop document store");
        }

        Ok(MigrationPreview::from_nodes(&scanned?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rackhd_store::bson::doc;

    #[test]
    fn test_preview_counts_units_and_rejects() {
        let nodes = vec![
            doc! {
                "_id": "a",
                "obmSettings": [
                    { "service": "ipmi-obm-service", "config": { "host": "h" } },
                    { "service": "redfish-obm-service", "config": { "host": "h" } },
                ],
                "sshSettings": { "host": "h" },
            },
            doc! { "_id": "b", "snmpSettings": "public" },
            doc! { "_id": "c" },
        ];

        let preview = MigrationPreview::from_nodes(&nodes);
        assert_eq!(preview.nodes_scanned, 3);
        assert_eq!(
            preview.kinds,
            vec![
                KindPreview { kind: SettingsKind::Obm, nodes: 1, units: 2, rejected: 0 },
                KindPreview { kind: SettingsKind::Ssh, nodes: 1, units: 1, rejected: 0 },
                KindPreview { kind: SettingsKind::Snmp, nodes: 1, units: 0, rejected: 1 },
            ]
        );
        assert_eq!(preview.records_to_write(), 3);
        assert!(preview.changes.iter().any(|c| c.contains("ipmi-obm-service, redfish-obm-service")));
        assert!(preview.changes.iter().any(|c| c.starts_with("Skip: snmp settings on node b")));
    }
}
