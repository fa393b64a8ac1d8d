//! Transport abstraction.
//!
//! The core only needs a byte stream: anything `AsyncRead + AsyncWrite`
//! works, which lets the integration tests drive a connection over an
//! in-memory duplex pipe. [`connect`] produces the default TCP transport.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{AmqwireError, Result};

/// A byte-stream transport for one connection.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Open a TCP transport to `host:port`, bounded by `timeout`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            AmqwireError::Client(format!(
                "timed out after {timeout:?} connecting to {host}:{port}"
            ))
        })??;

    // Frames are small and latency-sensitive.
    stream.set_nodelay(true).ok();
    Ok(stream)
}
