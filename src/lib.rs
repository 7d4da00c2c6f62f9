//! Wirecall - correlated request/response calls over a WebSocket
//!
//! Turns a message-oriented socket into a call interface: each request is
//! stamped with a correlation id and resolves with the reply that echoes the
//! id, or fails after a timeout. Sends issued while the socket is down are
//! queued and flushed in order when the connection next opens; reconnection
//! is lazy and only ever triggered by a send that could not go out.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::{WirecallClient, WirecallConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WirecallConfig::new("ws://localhost:9090/socket");
//!     let client = WirecallClient::new(config);
//!
//!     // Correlated call: resolves with the full reply envelope
//!     let reply = client.request(&serde_json::json!({"cmd": "login"})).await?;
//!     println!("logged in: {reply}");
//!
//!     // Fire-and-forget, no reply expected
//!     client.send_message(&serde_json::json!({"cmd": "log", "line": "hi"})).await;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod envelope;
mod error;

pub use client::{ConnectionState, PushHandler, WirecallClient};
pub use config::WirecallConfig;
pub use error::{Result, WirecallError};
