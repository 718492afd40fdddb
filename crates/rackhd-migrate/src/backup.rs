//! Pre-migration database dump.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::error::MigrationError;

/// What happened when the dump was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// The dump program exited successfully.
    Completed,
    /// The dump program exited unsuccessfully; the run continued.
    Failed { status: String },
    /// Backups were disabled for this run.
    Skipped,
}

/// Run the dump program to completion.
///
/// The migration has no way to tell whether the dump is usable, so a
/// non-zero exit only fails the run when `strict` is set. A program that
/// cannot be launched at all is always fatal.
#[tracing::instrument(skip(config), fields(program = %config.program))]
pub async fn run_backup(config: &BackupConfig) -> Result<BackupOutcome, MigrationError> {
    if !config.enabled {
        warn!("backup disabled, migrating without a dump");
        return Ok(BackupOutcome::Skipped);
    }

    info!(args = ?config.args, "taking database dump");
    let output = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| MigrationError::Backup {
            program: config.program.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
        debug!(stdout = %stdout.trim(), "backup output");
    }
    if !stderr.trim().is_empty() {
        debug!(stderr = %stderr.trim(), "backup diagnostics");
    }

    if output.status.success() {
        info!("database dump complete");
        return Ok(BackupOutcome::Completed);
    }

    let status = output.status.to_string();
    if config.strict {
        return Err(MigrationError::BackupFailed {
            program: config.program.clone(),
            status,
        });
    }

    warn!(%status, "database dump failed, continuing without a verified backup");
    Ok(BackupOutcome::Failed { status })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(program: &str, args: &[&str], strict: bool) -> BackupConfig {
        BackupConfig {
            enabled: true,
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            strict,
        }
    }

    #[tokio::test]
    async fn test_backup_skipped_when_disabled() {
        let cfg = BackupConfig {
            enabled: false,
            ..BackupConfig::default()
        };
        assert_eq!(run_backup(&cfg).await.unwrap(), BackupOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_backup_success() {
        let outcome = run_backup(&config("sh", &["-c", "echo dumped"], false))
            .await
            .unwrap();
        assert_eq!(outcome, BackupOutcome::Completed);
    }

    #[tokio::test]
    async fn test_backup_failure_tolerated() {
        let outcome = run_backup(&config("sh", &["-c", "exit 3"], false))
            .await
            .unwrap();
        assert!(matches!(outcome, BackupOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_backup_failure_fatal_when_strict() {
        let result = run_backup(&config("sh", &["-c", "exit 3"], true)).await;
        assert!(matches!(result, Err(MigrationError::BackupFailed { .. })));
    }

    #[tokio::test]
    async fn test_backup_missing_program_is_fatal() {
        let result = run_backup(&config("rackhd-no-such-dump-tool", &[], false)).await;
        assert!(matches!(result, Err(MigrationError::Backup { .. })));
    }
}
