//! Bulk removal of migrated legacy fields.

use rackhd_store::DocumentStore;
use tracing::{info, warn};

use crate::dispatch::DispatchReport;
use crate::error::MigrationError;

/// Remove the legacy field for the report's kind from the scanned nodes whose
/// units were all written.
///
/// Must only be called once the dispatcher has settled for that kind. Nodes
/// with a failed unit keep their legacy field so a later run can retry them,
/// and so does any node whose field changed or appeared after the scan.
#[tracing::instrument(skip_all, fields(kind = %report.kind))]
pub async fn purge_legacy_field(
    store: &dyn DocumentStore,
    report: &DispatchReport,
) -> Result<u64, MigrationError> {
    let field = report.kind.legacy_field();
    let targets = report.purge_targets();
    let retained = report.sources.len() - targets.len();
    if retained > 0 {
        warn!(
            field,
            retained,
            "keeping legacy field on nodes with failed writes"
        );
    }

    info!(field, targets = targets.len(), "removing legacy node settings");
    let modified = store
        .unset_node_field(field, &targets)
        .await
        .map_err(|source| MigrationError::Purge { field, source })?;

    if (modified as usize) < targets.len() {
        warn!(
            field,
            skipped = targets.len() - modified as usize,
            "legacy field changed after the scan, left in place"
        );
    }
    info!(field, modified, "legacy node settings removed");
    Ok(modified)
}
