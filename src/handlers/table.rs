//! Event-type → handlers routing table

use std::collections::HashMap;
use std::sync::Arc;

use super::Handler;

/// Immutable mapping from event type to the handlers registered for it,
/// in registration order
pub struct HandlerTable<E> {
    routes: HashMap<String, Vec<Arc<dyn Handler<E>>>>,
    handler_count: usize,
}

impl<E> HandlerTable<E> {
    /// Fold the handler list into per-type sequences
    pub fn build(handlers: Vec<Arc<dyn Handler<E>>>) -> Self {
        let handler_count = handlers.len();
        let routes = handlers.into_iter().fold(
            HashMap::<String, Vec<Arc<dyn Handler<E>>>>::new(),
            |mut routes, handler| {
                let mut seen: Vec<String> = Vec::new();
                for event_type in handler.allowed_types() {
                    if seen.contains(&event_type) {
                        continue;
                    }
                    routes
                        .entry(event_type.clone())
                        .or_default()
                        .push(Arc::clone(&handler));
                    seen.push(event_type);
                }
                routes
            },
        );

        Self {
            routes,
            handler_count,
        }
    }

    /// Handlers for `event_type`; empty when none are registered
    pub fn lookup(&self, event_type: &str) -> &[Arc<dyn Handler<E>>] {
        self.routes
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Event types with at least one handler
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handler_count
    }

    pub fn is_empty(&self) -> bool {
        self.handler_count == 0
    }
}
