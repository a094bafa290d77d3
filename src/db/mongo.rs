//! MongoDB-backed document store

use async_trait::async_trait;
use mongodb::{Client, Database};

use super::DocumentStore;
use crate::error::Result;

/// Document store on one MongoDB database
#[derive(Clone)]
pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    /// Connect and select the database named `database_name`
    pub async fn connect(url: &str, database_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(url).await?;
        let database = client.database(database_name);

        // Test connection
        database.list_collection_names().await?;

        tracing::info!(database = database_name, "Connected to mongodb");

        Ok(Self { database })
    }

    /// Wrap an existing database handle
    pub fn with_database(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.database.list_collection_names().await?)
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        self.database.create_collection(name).await?;
        tracing::info!(collection = name, "Created collection");
        Ok(())
    }

    fn database(&self) -> Option<Database> {
        Some(self.database.clone())
    }
}
