//! Change events for records written by the migration.
//!
//! A live system publishes an event for every record write. During a bulk
//! backfill those events are usually unwanted, so the dispatcher only
//! publishes when `suppress_change_notifications` is off.

use async_trait::async_trait;
use rackhd_store::{SettingsCollection, WriteOutcome};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

/// A settings record written by the migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordChange {
    pub collection: SettingsCollection,
    pub node: String,
    pub service: String,
    pub outcome: WriteOutcome,
}

/// Errors from publishing a change event.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Nobody is listening on the channel.
    #[error("no subscribers for record change on node {0}")]
    NoSubscribers(String),

    /// The destination refused or failed to take the event.
    #[error("publish failed: {0}")]
    Unavailable(String),
}

/// Destination for change events.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish(&self, change: &RecordChange) -> Result<(), PublishError>;
}

/// Publisher that writes each change to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl ChangePublisher for LogPublisher {
    async fn publish(&self, change: &RecordChange) -> Result<(), PublishError> {
        info!(
            collection = %change.collection,
            node = %change.node,
            service = %change.service,
            outcome = ?change.outcome,
            "record changed"
        );
        Ok(())
    }
}

#[async_trait]
impl ChangePublisher for broadcast::Sender<RecordChange> {
    async fn publish(&self, change: &RecordChange) -> Result<(), PublishError> {
        self.send(change.clone())
            .map(|_| ())
            .map_err(|e| PublishError::NoSubscribers(e.0.node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change() -> RecordChange {
        RecordChange {
            collection: SettingsCollection::Ibms,
            node: "node-b".to_string(),
            service: "snmp".to_string(),
            outcome: WriteOutcome::Inserted,
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let (tx, mut rx) = broadcast::channel::<RecordChange>(4);
        tx.publish(&change()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), change());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_errors() {
        let (tx, rx) = broadcast::channel::<RecordChange>(4);
        drop(rx);
        let err = tx.publish(&change()).await.unwrap_err();
        assert!(matches!(err, PublishError::NoSubscribers(ref node) if node == "node-b"));
    }

    #[tokio::test]
    async fn test_log_publisher_never_fails() {
        assert!(LogPublisher.publish(&change()).await.is_ok());
    }
}
