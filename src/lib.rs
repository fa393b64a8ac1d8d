//! # amqwire
//!
//! The core of an AMQP 0-9-1 client: the wire codec, the frame layer, and
//! the connection/channel state machines that multiplex logical channels
//! over one TCP transport.
//!
//! ## Architecture
//!
//! - **codec**: field values, tables, big-endian primitives, bit packing
//! - **protocol**: frame envelope, typed frames, the static method catalog
//! - **handler**: per-channel dispatch tables keyed by frame type or
//!   (class, method)
//! - **connection / channel**: the handshake, tune, heartbeat, flow and
//!   close state machines, driven by sender/receiver/heartbeater tasks
//!
//! ## Example
//!
//! ```ignore
//! use amqwire::{Connection, ConnectionOptions};
//!
//! #[tokio::main]
//! async fn main() -> amqwire::Result<()> {
//!     let connection = Connection::open(
//!         ConnectionOptions::new()
//!             .with_host("localhost")
//!             .with_heartbeat(30),
//!     )
//!     .await?;
//!
//!     let channel = connection.channel(None).await?;
//!     channel.close().await?;
//!     connection.close().await
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod channel;
mod connection;
mod state;

pub use channel::{Channel, REPLY_SUCCESS};
pub use connection::{Connection, ConnectionOptions, TuneParams, DEFAULT_CONNECT_TIMEOUT};
pub use error::{AmqwireError, Result};
pub use protocol::CloseReason;
pub use state::EndpointState;
