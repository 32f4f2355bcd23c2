//! Demonstration command handlers (ported from the reference server's
//! `commands` module). These are intentionally trivial - fixed
//! responses, no real auth or device state - and exist to exercise the
//! dispatch path end to end, exactly as they did in the system this
//! was ported from.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::connection::Connection;
use crate::error::HandlerError;
use crate::registry::{CommandHandler, HandlerRegistry};

pub struct Authorize;

#[async_trait]
impl CommandHandler for Authorize {
    async fn run(&self, _conn: &Connection, _msg_id: u32, _args: Value) -> Result<Value, HandlerError> {
        Ok(json!({"Hello": "World"}))
    }
}

pub struct Register;

#[async_trait]
impl CommandHandler for Register {
    async fn run(&self, _conn: &Connection, _msg_id: u32, _args: Value) -> Result<Value, HandlerError> {
        Ok(json!({
            "client_id": 1,
            "token_id": 1,
            "token_secret": "abc",
        }))
    }
}

pub struct CheckActivation;

#[async_trait]
impl CommandHandler for CheckActivation {
    async fn run(&self, _conn: &Connection, _msg_id: u32, _args: Value) -> Result<Value, HandlerError> {
        Err(HandlerError::new("notregistered", "device is not registered"))
    }
}

pub struct Bind;

#[async_trait]
impl CommandHandler for Bind {
    async fn run(&self, _conn: &Connection, _msg_id: u32, _args: Value) -> Result<Value, HandlerError> {
        Ok(Value::Null)
    }
}

/// Registers a long poll. The connection remembers the message id as
/// its `poll_id`, so a later server-initiated push can reply on the
/// same channel the client is blocked reading (`Connection::push_poll_request`).
pub struct StartPoll;

#[async_trait]
impl CommandHandler for StartPoll {
    async fn run(&self, conn: &Connection, msg_id: u32, _args: Value) -> Result<Value, HandlerError> {
        conn.set_poll_id(msg_id);
        Ok(json!({
            "response_queue": "return_addr",
            "response_id": 0,
            "request": {
                "system": "cs",
                "command": "get",
                "options": {"path": "status.product_info.mac0"},
                "event_trigger": {
                    "system": "cs",
                    "id": 0,
                    "trigger": {"event": "put", "path": "config", "delay": 0}
                }
            }
        }))
    }
}

/// Delivered as the result of an event trigger placed on a client; no
/// reply data, just an acknowledgement.
pub struct Post;

#[async_trait]
impl CommandHandler for Post {
    async fn run(&self, _conn: &Connection, _msg_id: u32, _args: Value) -> Result<Value, HandlerError> {
        Ok(Value::Null)
    }
}

/// Builds the registry with the demonstration handlers wired in.
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("authorize", std::sync::Arc::new(Authorize));
    registry.register("register", std::sync::Arc::new(Register));
    registry.register("check_activation", std::sync::Arc::new(CheckActivation));
    registry.register("bind", std::sync::Arc::new(Bind));
    registry.register("start_poll", std::sync::Arc::new(StartPoll));
    registry.register("post", std::sync::Arc::new(Post));
    registry
}
