//! Node settings migration for RackHD.
//!
//! Moves out-of-band management, ssh and snmp settings embedded on node
//! documents into the `obms` and `ibms` collections, then removes the legacy
//! fields from the nodes. The run is safe to repeat: records are upserted by
//! `(node, service)` and the legacy fields are only removed once their
//! settings have been written.

pub mod backup;
pub mod config;
pub mod dispatch;
mod error;
pub mod extract;
pub mod notify;
pub mod pipeline;
pub mod purge;
pub mod rehearse;
pub mod secrets;

pub use backup::{BackupOutcome, run_backup};
pub use config::{BackupConfig, MigrationConfig};
pub use dispatch::{DispatchReport, UnitFailure, UpsertDispatcher};
pub use error::MigrationError;
pub use extract::{
    ExtractError, LegacySettings, SettingsBatch, SettingsKind, SettingsUnit, extract,
};
pub use notify::{ChangePublisher, LogPublisher, PublishError, RecordChange};
pub use pipeline::{KindPreview, KindReport, MigrationPreview, MigrationReport, Migrator, Stage};
pub use purge::purge_legacy_field;
pub use secrets::{SecretsCodec, SecretsError};
