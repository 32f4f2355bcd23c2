//! Command dispatch table.
//!
//! Handlers are registered by name at `Server` construction and looked
//! up per incoming message. `CommandHandler::run` is `async` and
//! object-safe via `async-trait`. The reply envelope is lifted out of
//! the handler and into the dispatcher: centralizing it there rules out
//! a handler ever forgetting to wrap, or wrapping twice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::HandlerError;

/// A single command's business logic. Implementations receive the raw
/// `args` object from the incoming message (or `Value::Null` if the
/// message carried none) and return the data payload for a successful
/// reply, or a `HandlerError` for an error reply.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, conn: &Connection, msg_id: u32, args: Value) -> Result<Value, HandlerError>;
}

/// Maps command names to their handler. Built once at server startup
/// and shared read-only across every connection.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn run(&self, _conn: &Connection, _msg_id: u32, args: Value) -> Result<Value, HandlerError> {
            Ok(args)
        }
    }

    #[test]
    fn lookup_misses_return_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn registered_handler_is_found_by_name() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }
}
