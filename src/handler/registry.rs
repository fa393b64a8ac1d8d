//! Handler table for dispatching inbound frames.
//!
//! Each channel owns one table mapping a [`DispatchKey`] - either
//! (class id, method id) for method frames or the bare frame type for
//! everything else - to a shared handler. The table is mutated only from
//! the channel's own receiver task, or before that task runs; installing
//! over an existing key replaces it, clearing removes it.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::Result;
use crate::protocol::{Frame, FrameType, HeartbeatFrame, MethodFrame};

/// Key for handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    /// A method, by (class id, method id).
    Method { class_id: u16, method_id: u16 },
    /// A non-method frame, by frame type.
    Frame(FrameType),
}

impl DispatchKey {
    /// Method key shorthand.
    pub fn method(class_id: u16, method_id: u16) -> Self {
        DispatchKey::Method {
            class_id,
            method_id,
        }
    }
}

/// What a handler receives: the typed view of the inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A parsed method frame.
    Method(MethodFrame),
    /// A heartbeat.
    Heartbeat(HeartbeatFrame),
    /// Any other frame, raw (content header, body).
    Raw(Frame),
}

impl Inbound {
    /// Unwrap the method frame; dispatch guarantees this for method keys.
    pub fn into_method(self) -> Option<MethodFrame> {
        match self {
            Inbound::Method(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for frame handlers.
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one inbound frame on the given channel.
    fn call(&self, channel: Channel, inbound: Inbound) -> BoxFuture<'static, Result<()>>;
}

/// Wrapper turning an async function into a [`FrameHandler`].
struct FnHandler<F, Fut>
where
    F: Fn(Channel, Inbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    f: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FrameHandler for FnHandler<F, Fut>
where
    F: Fn(Channel, Inbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, channel: Channel, inbound: Inbound) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.f)(channel, inbound))
    }
}

/// Wrap an async function as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn FrameHandler>
where
    F: Fn(Channel, Inbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _phantom: PhantomData,
    })
}

/// A handler that accepts and discards its input. Used as a placeholder for
/// one-shot server-acked steps whose reply needs no action.
pub fn nop() -> Arc<dyn FrameHandler> {
    handler_fn(|_channel, _inbound| async { Ok(()) })
}

/// Per-channel handler table.
#[derive(Default)]
pub struct HandlerTable {
    entries: HashMap<DispatchKey, Arc<dyn FrameHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler, replacing any existing entry for the key.
    pub fn install(&mut self, key: DispatchKey, handler: Arc<dyn FrameHandler>) {
        self.entries.insert(key, handler);
    }

    /// Remove the handler for a key.
    pub fn remove(&mut self, key: &DispatchKey) {
        self.entries.remove(key);
    }

    /// Fetch a handler for dispatch.
    pub fn get(&self, key: &DispatchKey) -> Option<Arc<dyn FrameHandler>> {
        self.entries.get(key).cloned()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of installed handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
