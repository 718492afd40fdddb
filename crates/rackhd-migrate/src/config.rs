//! Run configuration.
//!
//! The binary fills these from command-line flags and environment variables;
//! the library only ever sees the resolved values.

/// How the pre-migration dump is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// Whether to run the dump at all.
    pub enabled: bool,
    /// Dump program, looked up on `PATH`.
    pub program: String,
    /// Extra arguments passed to the dump program.
    pub args: Vec<String>,
    /// Treat a non-zero exit from the dump program as fatal.
    pub strict: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "mongodump".to_string(),
            args: Vec::new(),
            strict: false,
        }
    }
}

/// Settings for one migration run.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub backup: BackupConfig,
    /// Base64 encoded 32-byte key used to seal credentials. `None` writes
    /// credentials through unchanged.
    pub encryption_key: Option<String>,
    /// Upper bound on in-flight upserts per settings kind.
    pub max_concurrent_writes: usize,
    /// Skip change events for records written by the migration.
    pub suppress_change_notifications: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            backup: BackupConfig::default(),
            encryption_key: None,
            max_concurrent_writes: 16,
            suppress_change_notifications: true,
        }
    }
}
