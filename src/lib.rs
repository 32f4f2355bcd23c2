//! LongerPull - bidirectional long-polling RPC framing and dispatch engine.
//!
//! A TCP server speaking a small binary-framed, JSON-bodied RPC
//! protocol built around one long-lived "poll" request per connection:
//! clients issue commands and the server can push requests back down
//! the same connection by replying on the poll's message id.
//!
//! # Quick start
//! ```rust,no_run
//! use longerpull::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::default());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

pub use connection::{Connection, Incoming};
pub use error::{ErrorPolicy, HandlerError, ProtocolError};
pub use protocol::{FrameCodec, OutFrame, RawFrame};
pub use registry::{CommandHandler, HandlerRegistry};
pub use server::{Server, ServerConfig, ServerStats};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version byte exchanged during the one-time handshake.
pub const PROTOCOL_VERSION: u8 = 1;
