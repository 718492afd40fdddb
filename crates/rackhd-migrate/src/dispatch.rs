//! Concurrent, failure-isolated settings upserts.

use futures_util::stream::{self, StreamExt};
use rackhd_store::bson::Bson;
use rackhd_store::{DocumentStore, FieldSnapshot, NodeId, WriteOutcome};
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::extract::{ExtractError, SettingsBatch, SettingsKind, SettingsUnit};
use crate::notify::{ChangePublisher, RecordChange};
use crate::secrets::SecretsCodec;

/// A settings unit that was not written.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub node: NodeId,
    pub service: Option<String>,
    pub error: String,
}

impl From<ExtractError> for UnitFailure {
    fn from(e: ExtractError) -> Self {
        Self {
            error: e.to_string(),
            node: e.node,
            service: None,
        }
    }
}

/// Aggregated outcome of one kind's dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub kind: SettingsKind,
    pub inserted: usize,
    pub updated: usize,
    pub failures: Vec<UnitFailure>,
    /// Legacy field values the dispatched units were read from.
    pub sources: Vec<FieldSnapshot>,
}

impl DispatchReport {
    pub fn new(kind: SettingsKind) -> Self {
        Self {
            kind,
            inserted: 0,
            updated: 0,
            failures: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Units written successfully.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    /// Raw ids of nodes with at least one failed unit, without duplicates.
    pub fn failed_nodes(&self) -> Vec<Bson> {
        let mut nodes: Vec<Bson> = Vec::new();
        for failure in &self.failures {
            let id = failure.node.as_bson();
            if !nodes.contains(id) {
                nodes.push(id.clone());
            }
        }
        nodes
    }

    /// Scanned fields whose units were all written, safe to remove.
    pub fn purge_targets(&self) -> Vec<FieldSnapshot> {
        let failed = self.failed_nodes();
        self.sources
            .iter()
            .filter(|source| !failed.contains(source.node.as_bson()))
            .cloned()
            .collect()
    }

    fn record(&mut self, outcome: Result<WriteOutcome, UnitFailure>) {
        match outcome {
            Ok(WriteOutcome::Inserted) => self.inserted += 1,
            Ok(WriteOutcome::Updated) => self.updated += 1,
            Err(failure) => self.failures.push(failure),
        }
    }
}

/// Writes settings units to their target collections.
///
/// All units handed to [`dispatch`](Self::dispatch) are in flight together,
/// bounded by `max_concurrent_writes`, and the call returns only once every
/// one of them has settled. A failing unit is logged and recorded; it never
/// stops its siblings.
pub struct UpsertDispatcher<'a> {
    store: &'a dyn DocumentStore,
    codec: &'a SecretsCodec,
    publisher: Option<&'a dyn ChangePublisher>,
    suppress_notifications: bool,
    max_concurrent: usize,
}

impl<'a> UpsertDispatcher<'a> {
    pub fn new(store: &'a dyn DocumentStore, codec: &'a SecretsCodec, config: &MigrationConfig) -> Self {
        Self {
            store,
            codec,
            publisher: None,
            suppress_notifications: config.suppress_change_notifications,
            max_concurrent: config.max_concurrent_writes.max(1),
        }
    }

    /// Publish a change event for every record written, unless suppressed.
    pub fn with_publisher(mut self, publisher: &'a dyn ChangePublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Write every unit and wait for all of them to settle.
    #[tracing::instrument(skip_all, fields(kind = %batch.kind, units = batch.units.len()))]
    pub async fn dispatch(&self, batch: SettingsBatch) -> DispatchReport {
        let SettingsBatch {
            kind,
            sources,
            units,
        } = batch;
        let outcomes: Vec<Result<WriteOutcome, UnitFailure>> = stream::iter(units)
            .map(|unit| self.write_unit(unit))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut report = DispatchReport::new(kind);
        report.sources = sources;
        for outcome in outcomes {
            report.record(outcome);
        }

        if report.failures.is_empty() {
            info!(
                inserted = report.inserted,
                updated = report.updated,
                "settings dispatched"
            );
        } else {
            warn!(
                inserted = report.inserted,
                updated = report.updated,
                failed = report.failures.len(),
                "settings dispatched with failures"
            );
        }
        report
    }

    async fn write_unit(
        &self,
        unit: Result<SettingsUnit, ExtractError>,
    ) -> Result<WriteOutcome, UnitFailure> {
        let mut unit = unit.map_err(|e| {
            warn!(node = %e.node, reason = %e.reason, "rejected settings block");
            UnitFailure::from(e)
        })?;

        debug!(node = %unit.node, service = %unit.service, "saving settings");

        if let Err(e) = self.codec.seal_credentials(&mut unit.config) {
            warn!(node = %unit.node, service = %unit.service, error = %e, "error sealing credentials");
            return Err(UnitFailure {
                node: unit.node,
                service: Some(unit.service),
                error: e.to_string(),
            });
        }

        let upsert = unit.into_upsert();
        let outcome = match self.store.upsert_settings(&upsert).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    node = %upsert.node,
                    service = %upsert.service,
                    error = %e,
                    "error saving settings record"
                );
                return Err(UnitFailure {
                    node: upsert.node,
                    service: Some(upsert.service),
                    error: e.to_string(),
                });
            }
        };

        if !self.suppress_notifications
            && let Some(publisher) = self.publisher
        {
            let change = RecordChange {
                collection: upsert.collection,
                node: upsert.node.to_string(),
                service: upsert.service.clone(),
                outcome,
            };
            if let Err(e) = publisher.publish(&change).await {
                warn!(node = %change.node, error = %e, "failed to publish record change");
            }
        }

        Ok(outcome)
    }
}
