//! External stores handed to handlers
//!
//! This module provides the dependency bag shared with every handler
//! invocation and the MongoDB / Redis implementations behind it.

pub mod mongo;
pub mod redis;
pub mod store;

// Re-export commonly used types
pub use self::mongo::MongoStore;
pub use self::redis::RedisChannel;
pub use store::{DocumentStore, NotificationChannel};

use std::sync::Arc;

use crate::error::{Error, Result};

/// Named external collaborators, any of which may be absent
#[derive(Clone, Default)]
pub struct Dependencies {
    /// Document store
    pub mongo: Option<Arc<dyn DocumentStore>>,

    /// Notification channel
    pub redis: Option<Arc<dyn NotificationChannel>>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mongo(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.mongo = Some(store);
        self
    }

    pub fn with_redis(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.redis = Some(channel);
        self
    }

    /// Document store, or a precondition error naming the missing dependency
    pub fn require_mongo(&self) -> Result<&Arc<dyn DocumentStore>> {
        self.mongo
            .as_ref()
            .ok_or_else(|| Error::missing_dependency("dependencies.mongo is not set."))
    }

    /// Notification channel, or a precondition error naming the missing dependency
    pub fn require_redis(&self) -> Result<&Arc<dyn NotificationChannel>> {
        self.redis
            .as_ref()
            .ok_or_else(|| Error::missing_dependency("dependencies.redis is not set."))
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("mongo", &self.mongo.is_some())
            .field("redis", &self.redis.is_some())
            .finish()
    }
}

/// Which stores `Consumer::init_dependencies` should connect
#[derive(Debug, Clone, Copy)]
pub struct DependencyOptions {
    pub mongo: bool,
    pub redis: bool,
}

impl Default for DependencyOptions {
    fn default() -> Self {
        Self {
            mongo: true,
            redis: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockDocumentStore, MockNotificationChannel};

    #[test]
    fn test_require_missing_dependency() {
        let deps = Dependencies::new();
        assert!(matches!(
            deps.require_mongo(),
            Err(Error::MissingDependency(_))
        ));
        assert!(matches!(
            deps.require_redis(),
            Err(Error::MissingDependency(_))
        ));
    }

    #[test]
    fn test_partial_dependencies() {
        let deps = Dependencies::new().with_redis(Arc::new(MockNotificationChannel::new()));
        assert!(deps.require_redis().is_ok());
        assert!(deps.require_mongo().is_err());

        let deps = deps.with_mongo(Arc::new(MockDocumentStore::new(&[])));
        assert!(deps.require_mongo().is_ok());
        assert_eq!(format!("{:?}", deps), "Dependencies { mongo: true, redis: true }");
    }

    #[test]
    fn test_dependency_options_default_enabled() {
        let options = DependencyOptions::default();
        assert!(options.mongo);
        assert!(options.redis);
    }
}
