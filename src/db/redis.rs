//! Redis-backed notification channel

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::timeout;

use super::NotificationChannel;
use crate::error::{Error, Result};

const REDIS_TIMEOUT_MILLISECS: u64 = 500;

/// Publishes notifications through one multiplexed connection
#[derive(Clone)]
pub struct RedisChannel {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl RedisChannel {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        tracing::info!("Connected to redis");

        Ok(Self { client, connection })
    }
}

#[async_trait]
impl NotificationChannel for RedisChannel {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let publish = conn.publish::<_, _, i64>(channel, payload);

        let receivers = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), publish)
            .await
            .map_err(|_| Error::store(format!("redis publish on '{}' timed out", channel)))??;

        tracing::trace!(channel, receivers, "Published notification");
        Ok(())
    }

    fn client(&self) -> Option<redis::Client> {
        Some(self.client.clone())
    }
}
