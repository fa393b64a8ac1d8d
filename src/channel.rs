//! Logical channels multiplexed over one connection.
//!
//! A channel owns a bounded receive queue fed by the connection's receiver
//! task and a handler table keyed by frame type or (class, method). Its own
//! receiver task drains the queue and dispatches each frame; handler errors
//! tear the channel down, protocol errors tear the connection down.
//!
//! Channel 0 is the connection-control channel: it is created and opened by
//! the connection and never closes independently of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::codec::Value;
use crate::connection::ConnectionInner;
use crate::error::{AmqwireError, Result};
use crate::handler::{handler_fn, DispatchKey, FrameHandler, HandlerTable, Inbound};
use crate::protocol::catalog::{channel as channel_method, class_id};
use crate::protocol::{CloseReason, Frame, FrameType, HeartbeatFrame, Method, MethodFrame};
use crate::state::{EndpointState, StateCell};

/// Reply code sent on a normal, client-initiated close.
pub const REPLY_SUCCESS: u16 = 200;

pub(crate) struct ChannelInner {
    id: u16,
    connection: Weak<ConnectionInner>,
    state: StateCell,
    /// Flow flag; true means the peer accepts content.
    flow: AtomicBool,
    /// Receive queue, taken by the receiver task when it starts.
    queue_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    handlers: Mutex<HandlerTable>,
    close_reason: Mutex<Option<CloseReason>>,
    flow_ack: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        // The receiver task ends when its queue closes; this only reaps a
        // task whose channel was abandoned before that happened.
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Handle to a logical channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel in Opening state and return its handle together
    /// with the sender side of its receive queue.
    pub(crate) fn create(
        connection: &Arc<ConnectionInner>,
        id: u16,
        queue_capacity: usize,
    ) -> (Channel, mpsc::Sender<Frame>) {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id,
                connection: Arc::downgrade(connection),
                state: StateCell::new(EndpointState::Opening),
                flow: AtomicBool::new(true),
                queue_rx: Mutex::new(Some(queue_rx)),
                handlers: Mutex::new(HandlerTable::new()),
                close_reason: Mutex::new(None),
                flow_ack: Notify::new(),
                task: Mutex::new(None),
            }),
        };
        (channel, queue_tx)
    }

    /// Channel id. Id 0 is the connection-control channel.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        self.inner.state.get()
    }

    /// Whether the channel is open.
    pub fn is_open(&self) -> bool {
        self.state() == EndpointState::Open
    }

    /// Flow flag: whether the peer currently accepts content.
    pub fn flow_active(&self) -> bool {
        self.inner.flow.load(Ordering::Relaxed)
    }

    /// The close reason recorded from a peer-initiated close, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Install a handler, replacing any existing entry for the key.
    pub fn set_handler(&self, key: DispatchKey, handler: Arc<dyn FrameHandler>) {
        self.inner.handlers.lock().install(key, handler);
    }

    /// Remove the handler for a key.
    pub fn clear_handler(&self, key: DispatchKey) {
        self.inner.handlers.lock().remove(&key);
    }

    pub(crate) fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.inner
            .connection
            .upgrade()
            .ok_or(AmqwireError::ConnectionClosed)
    }

    /// Enqueue a method frame on this channel.
    pub async fn send_method(&self, method: Method) -> Result<()> {
        let frame = MethodFrame::new(self.id(), method).into_frame()?;
        self.send_frame(frame).await
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.connection()?.send_frame(frame).await
    }

    /// Open a non-default channel: install the open-ok handler, send
    /// `channel.open`, and wait for the Open state.
    pub(crate) async fn open(&self) -> Result<()> {
        if self.id() == 0 {
            return Err(AmqwireError::Client(
                "channel 0 is opened by the connection".into(),
            ));
        }
        self.set_handler(
            DispatchKey::method(class_id::CHANNEL, channel_method::OPEN_OK),
            handler_fn(on_channel_open_ok),
        );
        self.send_method(Method::new(
            class_id::CHANNEL,
            channel_method::OPEN,
            vec![Value::ShortStr(String::new())],
        )?)
        .await?;

        let timeout = self.connection()?.connect_timeout();
        self.inner.state.wait_open(timeout, "channel").await
    }

    /// Close with the standard success code.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "Normal shutdown").await
    }

    /// Cooperative close: send `channel.close` and wait for the peer's
    /// `channel.close-ok`. Channel 0 delegates to the connection.
    pub async fn close_with(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        if self.id() == 0 {
            return self.connection()?.close_connection().await;
        }
        if self.state() == EndpointState::Closed {
            return Ok(());
        }

        let first = self.inner.state.transition(EndpointState::Closing);
        if first {
            let close = Method::new(
                class_id::CHANNEL,
                channel_method::CLOSE,
                vec![
                    Value::U16(reply_code),
                    Value::ShortStr(reply_text.to_string()),
                    Value::U16(0),
                    Value::U16(0),
                ],
            )?;
            if let Err(error) = self.send_method(close).await {
                self.teardown();
                return Err(error);
            }

            let timeout = self.connection()?.connect_timeout();
            if !self.inner.state.wait_closed(timeout).await {
                tracing::warn!(channel = self.id(), "close-ok not received, tearing down");
                self.teardown();
            }
        } else {
            self.inner.state.wait_closed(self.connection()?.connect_timeout()).await;
        }
        Ok(())
    }

    /// Request a flow change and wait for the peer's acknowledgement.
    pub async fn flow(&self, active: bool) -> Result<()> {
        if !self.is_open() {
            return Err(AmqwireError::ChannelClosed);
        }
        let acked = self.inner.flow_ack.notified();
        self.send_method(Method::new(
            class_id::CHANNEL,
            channel_method::FLOW,
            vec![Value::Bool(active)],
        )?)
        .await?;

        let timeout = self.connection()?.connect_timeout();
        tokio::time::timeout(timeout, acked).await.map_err(|_| {
            AmqwireError::Client(format!("timed out waiting for flow-ok on channel {}", self.id()))
        })?;
        Ok(())
    }

    /// Transition to Open. Used by the connection's open-ok handler for
    /// channel 0, whose lifecycle follows the connection's.
    pub(crate) fn mark_open(&self) {
        self.inner.state.transition(EndpointState::Open);
    }

    /// Abrupt close: no handshake, no waiting.
    pub(crate) fn close_abrupt(&self, reason: Option<CloseReason>) {
        if self.state() == EndpointState::Closed {
            return;
        }
        if let Some(reason) = reason {
            self.record_close_reason(reason);
        }
        self.inner.state.transition(EndpointState::Closing);
        self.teardown();
    }

    pub(crate) fn record_close_reason(&self, reason: CloseReason) {
        let mut slot = self.inner.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Remove from the connection's map, clear handlers, transition Closed.
    /// Dropping the map entry closes the receive queue, which ends the
    /// receiver task.
    pub(crate) fn teardown(&self) {
        if let Some(connection) = self.inner.connection.upgrade() {
            connection.remove_channel(self.inner.id);
        }
        self.force_closed();
    }

    /// Terminal cleanup that must not touch the connection's channel map;
    /// used while the connection itself is tearing down.
    pub(crate) fn force_closed(&self) {
        self.inner.handlers.lock().clear();
        self.inner.state.transition(EndpointState::Closed);
    }

    /// Install the post-open lifecycle handlers (flow, flow-ok, close,
    /// close-ok). Runs from the channel's receiver task.
    fn install_lifecycle_handlers(&self) {
        self.set_handler(
            DispatchKey::method(class_id::CHANNEL, channel_method::FLOW),
            handler_fn(on_channel_flow),
        );
        self.set_handler(
            DispatchKey::method(class_id::CHANNEL, channel_method::FLOW_OK),
            handler_fn(on_channel_flow_ok),
        );
        self.set_handler(
            DispatchKey::method(class_id::CHANNEL, channel_method::CLOSE),
            handler_fn(on_channel_close),
        );
        self.set_handler(
            DispatchKey::method(class_id::CHANNEL, channel_method::CLOSE_OK),
            handler_fn(on_channel_close_ok),
        );
    }

    /// Spawn the receiver task: drain the queue, dispatch each frame.
    pub(crate) fn spawn_receiver(&self) {
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            let queue = channel.inner.queue_rx.lock().take();
            let Some(mut queue) = queue else {
                return;
            };
            while let Some(frame) = queue.recv().await {
                if let Err(error) = channel.dispatch(frame).await {
                    channel.handle_dispatch_failure(error);
                    break;
                }
                if channel.state() == EndpointState::Closed {
                    break;
                }
            }
            tracing::debug!(channel = channel.id(), "receiver task finished");
        });
        *self.inner.task.lock() = Some(handle);
    }

    fn handle_dispatch_failure(&self, error: AmqwireError) {
        let fatal_to_connection =
            self.id() == 0 || matches!(error, AmqwireError::Protocol(_));
        tracing::warn!(
            channel = self.id(),
            error = %error,
            "dispatch failed, tearing down"
        );
        if fatal_to_connection {
            if let Ok(connection) = self.connection() {
                connection.record_failure(&error);
                tokio::spawn(async move {
                    connection.shutdown(true).await;
                });
            }
        } else {
            self.close_abrupt(None);
        }
    }

    async fn dispatch(&self, frame: Frame) -> Result<()> {
        let (key, inbound) = match frame.frame_type {
            FrameType::Method => {
                let method_frame = MethodFrame::parse(&frame)?;
                (
                    DispatchKey::method(
                        method_frame.method.class_id(),
                        method_frame.method.method_id(),
                    ),
                    Inbound::Method(method_frame),
                )
            }
            FrameType::Heartbeat => (
                DispatchKey::Frame(FrameType::Heartbeat),
                Inbound::Heartbeat(HeartbeatFrame::parse(&frame)?),
            ),
            other => (DispatchKey::Frame(other), Inbound::Raw(frame)),
        };

        let handler = self.inner.handlers.lock().get(&key);
        match handler {
            Some(handler) => handler.call(self.clone(), inbound).await,
            None => {
                tracing::warn!(channel = self.id(), ?key, "unexpected frame dropped");
                Ok(())
            }
        }
    }
}

fn expect_method(inbound: Inbound) -> Result<MethodFrame> {
    inbound
        .into_method()
        .ok_or_else(|| AmqwireError::Protocol("expected a method frame".into()))
}

async fn on_channel_open_ok(channel: Channel, _inbound: Inbound) -> Result<()> {
    channel.clear_handler(DispatchKey::method(class_id::CHANNEL, channel_method::OPEN_OK));
    channel.install_lifecycle_handlers();
    channel.inner.state.transition(EndpointState::Open);
    tracing::debug!(channel = channel.id(), "channel open");
    Ok(())
}

async fn on_channel_flow(channel: Channel, inbound: Inbound) -> Result<()> {
    let frame = expect_method(inbound)?;
    let active = frame.method.arg_bool("active")?;
    channel.inner.flow.store(active, Ordering::Relaxed);
    tracing::debug!(channel = channel.id(), active, "peer changed flow");
    channel
        .send_method(Method::new(
            class_id::CHANNEL,
            channel_method::FLOW_OK,
            vec![Value::Bool(active)],
        )?)
        .await
}

async fn on_channel_flow_ok(channel: Channel, inbound: Inbound) -> Result<()> {
    let frame = expect_method(inbound)?;
    let active = frame.method.arg_bool("active")?;
    channel.inner.flow.store(active, Ordering::Relaxed);
    channel.inner.flow_ack.notify_one();
    Ok(())
}

async fn on_channel_close(channel: Channel, inbound: Inbound) -> Result<()> {
    let frame = expect_method(inbound)?;
    let reason = CloseReason::from_method(&frame.method)?;
    tracing::debug!(
        channel = channel.id(),
        code = reason.reply_code,
        text = %reason.reply_text,
        "channel closed by peer"
    );
    channel.record_close_reason(reason);
    channel
        .send_method(Method::new(
            class_id::CHANNEL,
            channel_method::CLOSE_OK,
            vec![],
        )?)
        .await?;
    channel.inner.state.transition(EndpointState::Closing);
    channel.teardown();
    Ok(())
}

async fn on_channel_close_ok(channel: Channel, _inbound: Inbound) -> Result<()> {
    channel.teardown();
    Ok(())
}
