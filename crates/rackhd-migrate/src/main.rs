//! rackhd-migrate: move embedded node settings into dedicated collections
//!
//! Subcommands:
//! - `run`: dump the database, then migrate
//! - `preview`: report what `run` would change, without writing
//! - `rehearse`: run the migration in memory against an exported `nodes` collection

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rackhd_migrate::{
    BackupConfig, BackupOutcome, MigrationConfig, MigrationPreview, MigrationReport, Migrator,
    rehearse,
};
use rackhd_store::{DEFAULT_DATABASE, DEFAULT_URI, MongoConnector, StoreConfig};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "rackhd-migrate")]
#[command(about = "Move embedded node settings into the obms and ibms collections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// MongoDB connection string
    #[arg(long, env = "RACKHD_MONGO_URI", default_value = DEFAULT_URI)]
    mongo_uri: String,

    /// Database holding the nodes collection
    #[arg(long, env = "RACKHD_DATABASE", default_value = DEFAULT_DATABASE)]
    database: String,
}

impl StoreArgs {
    fn into_config(self) -> StoreConfig {
        StoreConfig {
            uri: self.mongo_uri,
            database: self.database,
            ..StoreConfig::default()
        }
    }
}

#[derive(Args)]
struct MigrateArgs {
    /// Base64 encoded 32-byte key used to seal credentials
    #[arg(long, env = "RACKHD_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Maximum number of settings upserts in flight at once
    #[arg(long, default_value = "16")]
    concurrency: usize,

    /// Publish a change event for every record written.
    /// Accepts "1", "true", "yes", or "on".
    #[arg(long, env = "RACKHD_PUBLISH_CHANGES", value_parser = parse_bool_env, default_value = "false")]
    publish_changes: bool,
}

impl MigrateArgs {
    fn into_config(self, backup: BackupConfig) -> MigrationConfig {
        MigrationConfig {
            backup,
            encryption_key: self.encryption_key,
            max_concurrent_writes: self.concurrency,
            suppress_change_notifications: !self.publish_changes,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the database, then migrate node settings
    Run {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        migrate: MigrateArgs,

        /// Dump program to run before migrating
        #[arg(long, default_value = "mongodump")]
        backup_program: String,

        /// Extra argument for the dump program (repeatable)
        #[arg(long = "backup-arg", value_name = "ARG", allow_hyphen_values = true)]
        backup_args: Vec<String>,

        /// Migrate without taking a dump first
        #[arg(long)]
        skip_backup: bool,

        /// Abort if the dump program exits unsuccessfully
        #[arg(long, conflicts_with = "skip_backup")]
        strict_backup: bool,
    },

    /// Show what `run` would change without writing anything
    Preview {
        #[command(flatten)]
        store: StoreArgs,

        /// Base64 encoded 32-byte key used to seal credentials
        #[arg(long, env = "RACKHD_ENCRYPTION_KEY", hide_env_values = true)]
        encryption_key: Option<String>,
    },

    /// Run the migration in memory against an exported nodes collection
    Rehearse {
        /// Export of the nodes collection (JSON array or one document per line)
        #[arg(long)]
        nodes: PathBuf,

        /// Write the resulting collections to this file
        #[arg(long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        migrate: MigrateArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "rackhd_migrate=info,rackhd_store=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            store,
            migrate,
            backup_program,
            backup_args,
            skip_backup,
            strict_backup,
        } => {
            let backup = BackupConfig {
                enabled: !skip_backup,
                program: backup_program,
                args: backup_args,
                strict: strict_backup,
            };
            let migrator = Migrator::new(
                MongoConnector::new(store.into_config()),
                migrate.into_config(backup),
            );
            let report = migrator.run().await.map_err(|e| miette::miette!("{}", e))?;
            print_report(&report);
            Ok(())
        }

        Commands::Preview {
            store,
            encryption_key,
        } => {
            let config = MigrationConfig {
                encryption_key,
                ..MigrationConfig::default()
            };
            let migrator = Migrator::new(MongoConnector::new(store.into_config()), config);
            let preview = migrator
                .preview()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_preview(&preview);
            Ok(())
        }

        Commands::Rehearse {
            nodes,
            output,
            migrate,
        } => {
            let docs = rehearse::load_nodes(&nodes)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            let config = migrate.into_config(BackupConfig::default());
            let (report, store) = rehearse::rehearse(docs, config)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_report(&report);

            if let Some(path) = output {
                rehearse::write_snapshot(&store, &path)
                    .await
                    .map_err(|e| miette::miette!("{}", e))?;
                println!("\nResulting collections written to {}", path.display());
            }
            Ok(())
        }
    }
}

fn print_report(report: &MigrationReport) {
    match &report.backup {
        BackupOutcome::Completed => println!("Backup: completed"),
        BackupOutcome::Failed { status } => println!("Backup: FAILED ({}), migration continued", status),
        BackupOutcome::Skipped => println!("Backup: skipped"),
    }
    println!("Scanned {} node document(s)\n", report.nodes_scanned);

    for kind in &report.kinds {
        let dispatch = &kind.dispatch;
        println!(
            "  {:<5} {} inserted, {} updated, {} failed; legacy field removed from {} node(s)",
            dispatch.kind,
            dispatch.inserted,
            dispatch.updated,
            dispatch.failures.len(),
            kind.purged
        );
        for failure in &dispatch.failures {
            println!("      Warning: node {}: {}", failure.node, failure.error);
        }
    }

    if report.unkeyed_documents > 0 {
        println!(
            "\nWarning: {} document(s) without an _id were skipped",
            report.unkeyed_documents
        );
    }
    if report.failures() > 0 {
        println!(
            "\n{} settings block(s) were not migrated; their nodes keep the legacy field. Rerun after fixing them.",
            report.failures()
        );
    }
}

fn print_preview(preview: &MigrationPreview) {
    println!("Scanned {} node document(s)\n", preview.nodes_scanned);
    for kind in &preview.kinds {
        println!(
            "  {:<5} {} node(s), {} record(s) to write, {} rejected",
            kind.kind, kind.nodes, kind.units, kind.rejected
        );
    }

    println!(
        "\nDry-run: {} record(s) would be written",
        preview.records_to_write()
    );
    if !preview.changes.is_empty() {
        println!("\nChanges:");
        for change in &preview.changes {
            println!("  - {}", change);
        }
    }
}
