//! Connection lifecycle and I/O core.
//!
//! One connection owns the transport, a single outbound send queue drained
//! by the sender task, a receiver task that demultiplexes inbound frames to
//! per-channel queues, and (once negotiated) a heartbeater. The open and
//! close handshakes are driven by handlers installed on channel 0.
//!
//! ```ignore
//! let connection = Connection::open(ConnectionOptions::default()).await?;
//! let channel = connection.channel(None).await?;
//! channel.close().await?;
//! connection.close().await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::{self, AuthRegistry};
use crate::channel::{Channel, REPLY_SUCCESS};
use crate::codec::{FieldTable, Value};
use crate::error::{AmqwireError, Result};
use crate::handler::{handler_fn, nop, DispatchKey, Inbound};
use crate::protocol::catalog::{class_id, connection as connection_method};
use crate::protocol::{
    CloseReason, Frame, FrameBuffer, FrameLimit, FrameType, Method, MethodFrame, PROTOCOL_HEADER,
};
use crate::state::{EndpointState, StateCell};
use crate::transport::{self, Transport};

/// Default connect / open-wait timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the outbound send queue.
const SEND_QUEUE_CAPACITY: usize = 1024;

/// Capacity of each channel's receive queue.
const CHANNEL_QUEUE_CAPACITY: usize = 256;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Bound on draining the send queue and on close handshakes.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiated connection limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuneParams {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

/// Zero on either side means "no preference"; both non-zero takes the
/// minimum.
fn negotiate<T: Ord + Default + Copy>(server: T, client: T) -> T {
    if server == T::default() {
        client
    } else if client == T::default() {
        server
    } else {
        server.min(client)
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Virtual host sent in `connection.open`.
    pub virtual_host: String,
    /// Client channel-max preference (0 = no preference).
    pub channel_max: u16,
    /// Client frame-max preference (0 = no client limit).
    pub frame_max: u32,
    /// Client heartbeat preference in seconds (0 = no client requirement).
    pub heartbeat: u16,
    /// Timeout for connecting and for open/close waits.
    pub connect_timeout: Duration,
    /// Preferred locale; falls back to the server's first advertised one.
    pub locale: String,
    /// Auth parameters (MECHANISM, LOGIN, PASSWORD, provider-specific keys).
    pub auth_params: HashMap<String, String>,
    /// Properties identifying this client to the server.
    pub client_properties: FieldTable,
    /// SASL providers.
    pub auth: AuthRegistry,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        let mut client_properties = FieldTable::new();
        client_properties.insert("product", Value::LongStr("amqwire".into()));
        client_properties.insert(
            "version",
            Value::LongStr(env!("CARGO_PKG_VERSION").into()),
        );
        client_properties.insert("platform", Value::LongStr("Rust".into()));
        client_properties.insert("capabilities", Value::Table(FieldTable::new()));

        Self {
            host: "localhost".into(),
            port: 5672,
            virtual_host: "/".into(),
            channel_max: 256,
            frame_max: 0,
            heartbeat: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            locale: "en_US".into(),
            auth_params: auth::default_params(),
            client_properties,
            auth: AuthRegistry::new(),
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    pub fn with_frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = frame_max;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: u16) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_auth_params(mut self, params: HashMap<String, String>) -> Self {
        self.auth_params = params;
        self
    }

    /// Convenience for the common LOGIN/PASSWORD pair.
    pub fn with_credentials(
        mut self,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth_params
            .insert(auth::LOGIN.to_string(), login.into());
        self.auth_params
            .insert(auth::PASSWORD.to_string(), password.into());
        self
    }

    pub fn with_client_properties(mut self, properties: FieldTable) -> Self {
        self.client_properties = properties;
        self
    }

    pub fn with_auth(mut self, auth: AuthRegistry) -> Self {
        self.auth = auth;
        self
    }
}

pub(crate) struct ChannelEntry {
    pub channel: Channel,
    pub queue: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct TaskHandles {
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    heartbeater: Option<JoinHandle<()>>,
}

pub(crate) struct ConnectionInner {
    options: ConnectionOptions,
    state: StateCell,
    server_properties: Mutex<FieldTable>,
    tune: Mutex<TuneParams>,
    blocked: AtomicBool,
    channels: Mutex<HashMap<u16, ChannelEntry>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    close_reason: Mutex<Option<CloseReason>>,
    fail_reason: Mutex<Option<String>>,
    frame_limit: FrameLimit,
    epoch: Instant,
    last_sent_ms: AtomicU64,
    last_received_ms: AtomicU64,
    tasks: Mutex<TaskHandles>,
    teardown_lock: tokio::sync::Mutex<()>,
}

impl ConnectionInner {
    pub(crate) fn new(options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: StateCell::new(EndpointState::Closed),
            server_properties: Mutex::new(FieldTable::new()),
            tune: Mutex::new(TuneParams::default()),
            blocked: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            close_reason: Mutex::new(None),
            fail_reason: Mutex::new(None),
            frame_limit: FrameLimit::new(),
            epoch: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
            tasks: Mutex::new(TaskHandles::default()),
            teardown_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.options.connect_timeout
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn stamp_sent(&self) {
        self.last_sent_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn stamp_received(&self) {
        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &AmqwireError) {
        let mut slot = self.fail_reason.lock();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }

    fn record_close_reason(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Enqueue a frame on the send queue; the sole path to the socket.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        let queue = self.outbound.lock().clone();
        match queue {
            Some(queue) => queue
                .send(frame)
                .await
                .map_err(|_| AmqwireError::ConnectionClosed),
            None => Err(AmqwireError::ConnectionClosed),
        }
    }

    pub(crate) fn remove_channel(&self, id: u16) {
        self.channels.lock().remove(&id);
    }

    /// Highest usable channel id under the negotiated (or configured) limit.
    fn channel_ceiling(&self) -> u16 {
        let negotiated = self.tune.lock().channel_max;
        if negotiated != 0 {
            negotiated
        } else if self.options.channel_max != 0 {
            self.options.channel_max
        } else {
            u16::MAX
        }
    }

    fn start_heartbeater(self: &Arc<Self>, interval: Duration) {
        let mut tasks = self.tasks.lock();
        if tasks.heartbeater.is_some() {
            return;
        }
        tasks.heartbeater = Some(spawn_guarded(
            "heartbeater",
            self.clone(),
            false,
            heartbeat_loop(self.clone(), interval),
        ));
    }

    pub(crate) async fn close_connection(self: &Arc<Self>) -> Result<()> {
        self.close_impl(true, false, REPLY_SUCCESS, "Normal shutdown", None)
            .await;
        if !self.state.wait_closed(CLOSE_DRAIN_TIMEOUT).await {
            self.teardown().await;
        }
        Ok(())
    }

    /// Abrupt close used by failing background tasks.
    pub(crate) async fn shutdown(self: &Arc<Self>, by_peer: bool) {
        self.close_impl(false, by_peer, REPLY_SUCCESS, "", None).await;
    }

    /// The close protocol. The first invocation transitions to Closing and
    /// closes every non-zero channel; a cooperative, locally-initiated close
    /// additionally sends `connection.close` and waits for the peer's
    /// `connection.close-ok` before tearing down.
    async fn close_impl(
        self: &Arc<Self>,
        handshake: bool,
        by_peer: bool,
        reply_code: u16,
        reply_text: &str,
        reason: Option<CloseReason>,
    ) {
        if self.state.get() == EndpointState::Closed {
            return;
        }
        if let Some(reason) = reason {
            self.record_close_reason(reason);
        }

        let first = self.state.transition(EndpointState::Closing);
        if first {
            let channels: Vec<Channel> = self
                .channels
                .lock()
                .values()
                .filter(|entry| entry.channel.id() != 0)
                .map(|entry| entry.channel.clone())
                .collect();
            for channel in channels {
                channel.close_abrupt(None);
            }

            if handshake && !by_peer {
                if let Err(error) = self.send_close_method(reply_code, reply_text).await {
                    tracing::debug!(error = %error, "could not send connection.close");
                }
                if self.state.wait_closed(CLOSE_DRAIN_TIMEOUT).await {
                    return;
                }
                tracing::warn!("close-ok not received, tearing down");
                self.teardown().await;
                return;
            }
        }

        if !handshake || by_peer {
            self.teardown().await;
        }
    }

    async fn send_close_method(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        let close = Method::new(
            class_id::CONNECTION,
            connection_method::CLOSE,
            vec![
                Value::U16(reply_code),
                Value::ShortStr(reply_text.to_string()),
                Value::U16(0),
                Value::U16(0),
            ],
        )?;
        self.send_frame(MethodFrame::new(0, close).into_frame()?).await
    }

    /// Terminal teardown: drain and close the send queue, hard-stop the
    /// receiver and heartbeater, reset negotiated parameters, close all
    /// channels, transition Closed.
    async fn teardown(self: &Arc<Self>) {
        let _guard = self.teardown_lock.lock().await;
        if self.state.get() == EndpointState::Closed {
            return;
        }

        // Closing the queue lets the sender flush buffered frames (a
        // queued close-ok among them) before it shuts the write side.
        drop(self.outbound.lock().take());
        let sender = self.tasks.lock().sender.take();
        if let Some(mut handle) = sender {
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("send queue did not drain in time");
                handle.abort();
            }
        }

        if let Some(handle) = self.tasks.lock().receiver.take() {
            handle.abort();
        }
        if let Some(handle) = self.tasks.lock().heartbeater.take() {
            handle.abort();
        }

        let entries: Vec<ChannelEntry> = self
            .channels
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &entries {
            entry.channel.force_closed();
        }
        drop(entries);

        *self.tune.lock() = TuneParams::default();
        self.state.transition(EndpointState::Closed);
        tracing::debug!("connection closed");
    }

    /// Acquire a channel by id, or auto-assign the first unused id.
    async fn acquire_channel(self: &Arc<Self>, id: Option<u16>) -> Result<Channel> {
        if self.state.get() != EndpointState::Open {
            return Err(AmqwireError::ConnectionClosed);
        }

        let ceiling = self.channel_ceiling();
        let channel = {
            let mut channels = self.channels.lock();
            let id = match id {
                Some(0) => {
                    return Err(AmqwireError::Client(
                        "channel 0 is managed by the connection".into(),
                    ))
                }
                Some(id) if id > ceiling => {
                    return Err(AmqwireError::Client(format!(
                        "channel id {id} exceeds maximum {ceiling}"
                    )))
                }
                Some(id) => {
                    if channels.contains_key(&id) {
                        return Err(AmqwireError::Client(format!(
                            "channel {id} is already in use"
                        )));
                    }
                    id
                }
                None => (1..=ceiling)
                    .find(|candidate| !channels.contains_key(candidate))
                    .ok_or_else(|| AmqwireError::Client("no free channel id".into()))?,
            };

            let (channel, queue) = Channel::create(self, id, CHANNEL_QUEUE_CAPACITY);
            channels.insert(
                id,
                ChannelEntry {
                    channel: channel.clone(),
                    queue,
                },
            );
            channel
        };

        channel.spawn_receiver();
        match channel.open().await {
            Ok(()) => Ok(channel),
            Err(error) => {
                channel.close_abrupt(None);
                Err(error)
            }
        }
    }
}

/// A connection to a broker.
///
/// Opening performs the full handshake; the returned handle is used to
/// acquire channels and to close. Dropping the handle without closing tears
/// the connection down abruptly.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect over TCP using the options' host and port, then run the open
    /// handshake.
    pub async fn open(options: ConnectionOptions) -> Result<Connection> {
        let stream = transport::connect(&options.host, options.port, options.connect_timeout)
            .await?;
        Self::open_with_transport(options, stream).await
    }

    /// Run the open handshake over an already-connected transport.
    pub async fn open_with_transport<T: Transport>(
        options: ConnectionOptions,
        transport: T,
    ) -> Result<Connection> {
        let (read_half, mut write_half) = tokio::io::split(transport);

        // The protocol header precedes every other byte on the wire.
        write_half.write_all(&PROTOCOL_HEADER).await?;

        let inner = ConnectionInner::new(options);
        let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        *inner.outbound.lock() = Some(queue_tx);
        inner.stamp_sent();
        inner.stamp_received();

        // Channel 0 carries the handshake; its handlers are installed
        // before any task runs.
        let (channel_zero, queue) = Channel::create(&inner, 0, CHANNEL_QUEUE_CAPACITY);
        channel_zero.set_handler(
            DispatchKey::method(class_id::CONNECTION, connection_method::START),
            handler_fn(on_connection_start),
        );
        channel_zero.set_handler(
            DispatchKey::method(class_id::CONNECTION, connection_method::TUNE),
            handler_fn(on_connection_tune),
        );
        channel_zero.set_handler(
            DispatchKey::method(class_id::CONNECTION, connection_method::OPEN_OK),
            handler_fn(on_connection_open_ok),
        );
        channel_zero.set_handler(DispatchKey::Frame(FrameType::Heartbeat), nop());
        inner.channels.lock().insert(
            0,
            ChannelEntry {
                channel: channel_zero.clone(),
                queue,
            },
        );

        inner.state.transition(EndpointState::Opening);

        {
            let mut tasks = inner.tasks.lock();
            tasks.sender = Some(spawn_guarded(
                "sender",
                inner.clone(),
                true,
                sender_loop(queue_rx, write_half, inner.clone()),
            ));
            tasks.receiver = Some(spawn_guarded(
                "receiver",
                inner.clone(),
                true,
                receiver_loop(read_half, inner.clone()),
            ));
        }
        channel_zero.spawn_receiver();

        let timeout = inner.options.connect_timeout;
        match inner.state.wait_open(timeout, "connection").await {
            Ok(()) => Ok(Connection { inner }),
            Err(error) => {
                inner.shutdown(false).await;
                let detail = inner.fail_reason.lock().clone();
                Err(match detail {
                    Some(detail) => {
                        AmqwireError::Client(format!("open handshake failed: {detail}"))
                    }
                    None => error,
                })
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        self.inner.state.get()
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == EndpointState::Open
    }

    /// Whether the broker has announced it is blocking publishes.
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::Relaxed)
    }

    /// Negotiated limits, zeroed until Tune completes.
    pub fn tune_params(&self) -> TuneParams {
        self.inner.tune.lock().clone()
    }

    /// Properties the server announced in `connection.start`.
    pub fn server_properties(&self) -> FieldTable {
        self.inner.server_properties.lock().clone()
    }

    /// The server's advertised capability table, empty if none.
    pub fn server_capabilities(&self) -> FieldTable {
        self.inner
            .server_properties
            .lock()
            .get("capabilities")
            .and_then(Value::as_table)
            .cloned()
            .unwrap_or_default()
    }

    /// The close reason recorded from a peer-initiated close, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Acquire a channel: `Some(id)` for an explicit id, `None` for the
    /// first unused id.
    pub async fn channel(&self, id: Option<u16>) -> Result<Channel> {
        self.inner.acquire_channel(id).await
    }

    /// Enqueue an outbound frame.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.inner.send_frame(frame).await
    }

    /// Cooperative close with the standard success code.
    pub async fn close(&self) -> Result<()> {
        self.inner.close_connection().await
    }

    /// Cooperative close with an explicit reply code and text.
    pub async fn close_with(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        self.inner
            .close_impl(true, false, reply_code, reply_text, None)
            .await;
        if !self.inner.state.wait_closed(CLOSE_DRAIN_TIMEOUT).await {
            self.inner.teardown().await;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.inner.state.get() != EndpointState::Closed {
            tracing::debug!("connection handle dropped while open, tearing down");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    inner.shutdown(false).await;
                });
            }
        }
    }
}

/// Spawn a task whose failure closes the connection.
fn spawn_guarded<F>(
    name: &'static str,
    inner: Arc<ConnectionInner>,
    by_peer: bool,
    task: F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(()) => tracing::debug!(task = name, "task finished"),
            Err(error) => {
                tracing::warn!(task = name, error = %error, "task failed, closing connection");
                inner.record_failure(&error);
                let connection = inner.clone();
                tokio::spawn(async move {
                    connection.shutdown(by_peer).await;
                });
            }
        }
    })
}

/// Sender task: drain the send queue onto the socket in enqueue order. When
/// the queue closes, flush what is buffered and shut the write side.
async fn sender_loop<W: AsyncWrite + Send + Unpin>(
    mut queue: mpsc::Receiver<Frame>,
    mut write: W,
    inner: Arc<ConnectionInner>,
) -> Result<()> {
    while let Some(frame) = queue.recv().await {
        let bytes = frame.encode();
        write.write_all(&bytes).await?;
        inner.stamp_sent();
    }
    write.shutdown().await.ok();
    Ok(())
}

/// Receiver task: read bytes, reassemble frames, route each to its
/// channel's receive queue. Frames for unknown channels are dropped.
async fn receiver_loop<R: AsyncRead + Send + Unpin>(
    mut read: R,
    inner: Arc<ConnectionInner>,
) -> Result<()> {
    let mut frames = FrameBuffer::with_limit(inner.frame_limit.clone());
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Err(AmqwireError::ConnectionClosed);
        }
        inner.stamp_received();

        for frame in frames.push(&buf[..n])? {
            let channel_id = frame.channel;
            let queue = inner
                .channels
                .lock()
                .get(&channel_id)
                .map(|entry| entry.queue.clone());
            match queue {
                Some(queue) => {
                    if queue.send(frame).await.is_err() {
                        tracing::debug!(channel = channel_id, "receive queue closed, frame dropped");
                    }
                }
                None => {
                    tracing::warn!(channel = channel_id, "frame for unknown channel dropped");
                }
            }
        }
    }
}

/// Heartbeater task: wake once per interval; send a heartbeat after one
/// idle interval outbound, declare the peer dead after two idle intervals
/// inbound.
async fn heartbeat_loop(inner: Arc<ConnectionInner>, interval: Duration) -> Result<()> {
    let interval_ms = interval.as_millis() as u64;
    loop {
        tokio::time::sleep(interval).await;

        match inner.state.get() {
            EndpointState::Closed | EndpointState::Closing => return Ok(()),
            _ => {}
        }

        let now = inner.now_ms();
        let received = inner.last_received_ms.load(Ordering::Relaxed);
        if now.saturating_sub(received) >= 2 * interval_ms {
            return Err(AmqwireError::Protocol(format!(
                "no traffic from peer for {} seconds, connection is dead",
                2 * interval.as_secs()
            )));
        }

        let sent = inner.last_sent_ms.load(Ordering::Relaxed);
        if now.saturating_sub(sent) >= interval_ms {
            inner.send_frame(Frame::heartbeat()).await?;
        }
    }
}

fn expect_method(inbound: Inbound) -> Result<MethodFrame> {
    inbound
        .into_method()
        .ok_or_else(|| AmqwireError::Protocol("expected a method frame".into()))
}

/// Capabilities the client echoes back when the server advertises them.
const ECHOED_CAPABILITIES: [&str; 2] = ["consumer_cancel_notify", "connection.blocked"];

async fn on_connection_start(channel: Channel, inbound: Inbound) -> Result<()> {
    let connection = channel.connection()?;
    let frame = expect_method(inbound)?;
    let method = &frame.method;

    let server_properties = method.arg_table("server-properties")?.clone();
    let mechanisms = method.arg_str("mechanisms")?.to_string();
    let locales = method.arg_str("locales")?.to_string();
    tracing::debug!(%mechanisms, %locales, "connection.start received");

    let params = &connection.options.auth_params;
    let mechanism = params
        .get(auth::MECHANISM)
        .cloned()
        .unwrap_or_else(|| auth::DEFAULT_MECHANISM.to_string());
    if !mechanisms.split_ascii_whitespace().any(|m| m == mechanism) {
        return Err(AmqwireError::Client(format!(
            "server does not offer auth mechanism '{mechanism}' (offers: {mechanisms})"
        )));
    }

    // Client preference when advertised, else the first advertised locale.
    let locale = if locales
        .split_ascii_whitespace()
        .any(|l| l == connection.options.locale)
    {
        connection.options.locale.clone()
    } else {
        locales
            .split_ascii_whitespace()
            .next()
            .unwrap_or(connection.options.locale.as_str())
            .to_string()
    };

    let response = connection.options.auth.respond(&mechanism, params)?;

    let mut client_properties = connection.options.client_properties.clone();
    let mut capabilities = client_properties
        .get("capabilities")
        .and_then(Value::as_table)
        .cloned()
        .unwrap_or_default();
    let server_capabilities = server_properties
        .get("capabilities")
        .and_then(Value::as_table)
        .cloned()
        .unwrap_or_default();
    for name in ECHOED_CAPABILITIES {
        let advertised = server_capabilities
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if advertised {
            capabilities.insert(name, Value::Bool(true));
        }
    }
    client_properties.insert("capabilities", Value::Table(capabilities));

    *connection.server_properties.lock() = server_properties;

    channel.clear_handler(DispatchKey::method(
        class_id::CONNECTION,
        connection_method::START,
    ));
    channel
        .send_method(Method::new(
            class_id::CONNECTION,
            connection_method::START_OK,
            vec![
                Value::Table(client_properties),
                Value::ShortStr(mechanism),
                Value::Bytes(response.to_vec()),
                Value::ShortStr(locale),
            ],
        )?)
        .await
}

async fn on_connection_tune(channel: Channel, inbound: Inbound) -> Result<()> {
    let connection = channel.connection()?;
    let frame = expect_method(inbound)?;
    let method = &frame.method;

    let negotiated = TuneParams {
        channel_max: negotiate(
            method.arg_u16("channel-max")?,
            connection.options.channel_max,
        ),
        frame_max: negotiate(method.arg_u32("frame-max")?, connection.options.frame_max),
        heartbeat: negotiate(method.arg_u16("heartbeat")?, connection.options.heartbeat),
    };
    tracing::debug!(
        channel_max = negotiated.channel_max,
        frame_max = negotiated.frame_max,
        heartbeat = negotiated.heartbeat,
        "tuned"
    );

    connection.frame_limit.set(negotiated.frame_max);
    *connection.tune.lock() = negotiated.clone();

    channel.clear_handler(DispatchKey::method(
        class_id::CONNECTION,
        connection_method::TUNE,
    ));
    channel
        .send_method(Method::new(
            class_id::CONNECTION,
            connection_method::TUNE_OK,
            vec![
                Value::U16(negotiated.channel_max),
                Value::U32(negotiated.frame_max),
                Value::U16(negotiated.heartbeat),
            ],
        )?)
        .await?;

    if negotiated.heartbeat > 0 {
        connection.start_heartbeater(Duration::from_secs(negotiated.heartbeat as u64));
    }

    channel
        .send_method(Method::new(
            class_id::CONNECTION,
            connection_method::OPEN,
            vec![
                Value::ShortStr(connection.options.virtual_host.clone()),
                Value::ShortStr(String::new()),
                Value::Bool(false),
            ],
        )?)
        .await
}

async fn on_connection_open_ok(channel: Channel, _inbound: Inbound) -> Result<()> {
    let connection = channel.connection()?;

    channel.clear_handler(DispatchKey::method(
        class_id::CONNECTION,
        connection_method::OPEN_OK,
    ));
    channel.set_handler(
        DispatchKey::method(class_id::CONNECTION, connection_method::CLOSE),
        handler_fn(on_connection_close),
    );
    channel.set_handler(
        DispatchKey::method(class_id::CONNECTION, connection_method::CLOSE_OK),
        handler_fn(on_connection_close_ok),
    );
    channel.set_handler(
        DispatchKey::method(class_id::CONNECTION, connection_method::BLOCKED),
        handler_fn(on_connection_blocked),
    );
    channel.set_handler(
        DispatchKey::method(class_id::CONNECTION, connection_method::UNBLOCKED),
        handler_fn(on_connection_unblocked),
    );

    channel.mark_open();
    connection.state.transition(EndpointState::Open);
    tracing::debug!("connection open");
    Ok(())
}

async fn on_connection_close(channel: Channel, inbound: Inbound) -> Result<()> {
    let connection = channel.connection()?;
    let frame = expect_method(inbound)?;
    let reason = CloseReason::from_method(&frame.method)?;
    tracing::debug!(
        code = reason.reply_code,
        text = %reason.reply_text,
        "connection closed by peer"
    );

    channel
        .send_method(Method::new(
            class_id::CONNECTION,
            connection_method::CLOSE_OK,
            vec![],
        )?)
        .await?;

    // The queued close-ok drains during teardown before the socket closes.
    connection
        .close_impl(false, true, REPLY_SUCCESS, "", Some(reason))
        .await;
    Ok(())
}

async fn on_connection_close_ok(channel: Channel, _inbound: Inbound) -> Result<()> {
    let connection = channel.connection()?;
    connection.close_impl(false, false, REPLY_SUCCESS, "", None).await;
    Ok(())
}

async fn on_connection_blocked(channel: Channel, inbound: Inbound) -> Result<()> {
    let connection = channel.connection()?;
    let frame = expect_method(inbound)?;
    let reason = frame.method.arg_str("reason").unwrap_or_default();
    tracing::warn!(%reason, "broker blocked the connection");
    connection.blocked.store(true, Ordering::Relaxed);
    Ok(())
}

async fn on_connection_unblocked(channel: Channel, _inbound: Inbound) -> Result<()> {
    let connection = channel.connection()?;
    tracing::debug!("broker unblocked the connection");
    connection.blocked.store(false, Ordering::Relaxed);
    Ok(())
}
