//! Error types for the migration pipeline.

use rackhd_store::StoreError;
use thiserror::Error;

use crate::secrets::SecretsError;

/// Stage-level failures. Any of these ends the run.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The dump utility could not be launched.
    #[error("failed to launch backup program {program}: {source}")]
    Backup {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The dump utility exited unsuccessfully while a clean backup was required.
    #[error("backup program {program} exited with {status}")]
    BackupFailed { program: String, status: String },

    /// The secrets codec could not start.
    #[error("secrets codec: {0}")]
    Secrets(#[from] SecretsError),

    /// The document store could not be opened.
    #[error("failed to connect to document store: {0}")]
    Connect(#[source] StoreError),

    /// Settings indexes could not be created.
    #[error("failed to ensure settings indexes: {0}")]
    Indexes(#[source] StoreError),

    /// Node documents could not be read.
    #[error("failed to scan node documents: {0}")]
    Scan(#[source] StoreError),

    /// Bulk removal of a legacy field failed.
    #[error("failed to purge {field} from node documents: {source}")]
    Purge {
        field: &'static str,
        #[source]
        source: StoreError,
    },

    /// A rehearsal file could not be read or written.
    #[error("failed to access {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration or input file contents.
    #[error("invalid configuration: {0}")]
    Config(String),
}
