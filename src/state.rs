//! Lifecycle state for connections and channels.
//!
//! Both endpoints walk the same machine: Closed → Opening → Open → Closing →
//! Closed, each state visited at most once per lifetime, with an abrupt jump
//! to Closed permitted from anywhere. The cell is backed by a `watch`
//! channel so tasks can await a transition with a timeout.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{AmqwireError, Result};

/// Lifecycle states shared by connections and channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl EndpointState {
    fn rank(self) -> u8 {
        match self {
            EndpointState::Closed => 0,
            EndpointState::Opening => 1,
            EndpointState::Open => 2,
            EndpointState::Closing => 3,
        }
    }
}

/// Observable, monotonic state cell.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<EndpointState>,
}

impl StateCell {
    pub fn new(initial: EndpointState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> EndpointState {
        *self.tx.borrow()
    }

    /// Attempt a transition. Forward moves and abrupt jumps to Closed are
    /// allowed; anything else is refused. Returns whether the state changed.
    pub fn transition(&self, to: EndpointState) -> bool {
        let mut moved = false;
        self.tx.send_modify(|current| {
            let allowed = if to == EndpointState::Closed {
                *current != EndpointState::Closed
            } else {
                to.rank() > current.rank()
            };
            if allowed {
                *current = to;
                moved = true;
            }
        });
        moved
    }

    /// Wait until Open. Reaching Closed first, or timing out, is an error.
    pub async fn wait_open(&self, timeout: Duration, what: &str) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let result = {
            let wait = rx.wait_for(|s| matches!(s, EndpointState::Open | EndpointState::Closed));
            match tokio::time::timeout(timeout, wait).await {
                Err(_) => Err(AmqwireError::Client(format!(
                    "timed out after {timeout:?} waiting for {what} to open"
                ))),
                Ok(Err(_)) => Err(AmqwireError::ConnectionClosed),
                Ok(Ok(state)) if *state == EndpointState::Open => Ok(()),
                Ok(Ok(_)) => Err(AmqwireError::Client(format!(
                    "{what} closed during open handshake"
                ))),
            }
        };
        result
    }

    /// Wait until Closed, bounded.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let result = {
            let wait = rx.wait_for(|s| *s == EndpointState::Closed);
            matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)))
        };
        result
    }
}
