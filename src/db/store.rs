//! Store abstractions handed to handlers as dependencies
//!
//! The engine only needs a narrow slice of each store: collection listing
//! and creation for the document store, publish for the notification channel.

use async_trait::async_trait;

use crate::error::Result;

/// Document store used for collection provisioning
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of the collections that currently exist
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Create a collection
    async fn create_collection(&self, name: &str) -> Result<()>;

    /// Underlying database handle, for handlers doing real work
    fn database(&self) -> Option<mongodb::Database> {
        None
    }
}

/// Key-value channel used for side-effect notifications
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Publish a payload on a channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Underlying client handle, for handlers doing real work
    fn client(&self) -> Option<redis::Client> {
        None
    }
}
