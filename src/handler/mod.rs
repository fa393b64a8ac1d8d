//! Method dispatch: handler keys, the handler trait, and per-channel tables.

mod registry;

pub use registry::{
    handler_fn, nop, BoxFuture, DispatchKey, FrameHandler, HandlerTable, Inbound,
};
