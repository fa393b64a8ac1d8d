//! Integration tests driving a real connection against a scripted broker
//! over an in-memory duplex transport.
//!
//! The broker speaks the same wire format through the crate's own frame
//! layer: it answers the open handshake, replies to channel lifecycle
//! methods, and records what the client sent for assertions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use amqwire::codec::{FieldTable, Value};
use amqwire::protocol::catalog::{channel as channel_method, class_id, connection as connection_method};
use amqwire::protocol::{Frame, FrameBuffer, FrameType, Method, MethodFrame, PROTOCOL_HEADER};
use amqwire::{Connection, ConnectionOptions, EndpointState};

#[derive(Clone)]
struct BrokerBehavior {
    tune: (u16, u32, u16),
    mechanisms: &'static str,
    echo_heartbeats: bool,
}

impl Default for BrokerBehavior {
    fn default() -> Self {
        Self {
            tune: (2048, 131072, 0),
            mechanisms: "PLAIN AMQPLAIN",
            echo_heartbeats: true,
        }
    }
}

#[derive(Default)]
struct BrokerLog {
    start_ok: Mutex<Option<(String, String)>>,
    client_capabilities: Mutex<Option<FieldTable>>,
    tune_ok: Mutex<Option<(u16, u32, u16)>>,
    heartbeats: AtomicUsize,
    connection_close: AtomicBool,
    channel_close_ok: Mutex<Vec<u16>>,
    client_flow_ok: Mutex<Vec<(u16, bool)>>,
    bodies: Mutex<Vec<Vec<u8>>>,
}

struct TestBroker {
    log: Arc<BrokerLog>,
    inject: mpsc::Sender<Frame>,
    handle: JoinHandle<()>,
}

fn server_properties() -> FieldTable {
    let mut capabilities = FieldTable::new();
    capabilities.insert("consumer_cancel_notify", Value::Bool(true));
    capabilities.insert("connection.blocked", Value::Bool(true));

    let mut properties = FieldTable::new();
    properties.insert("product", Value::LongStr("MockBroker".into()));
    properties.insert("capabilities", Value::Table(capabilities));
    properties
}

async fn send(stream: &mut DuplexStream, frame: Frame) -> bool {
    stream.write_all(&frame.encode()).await.is_ok()
}

async fn send_method(stream: &mut DuplexStream, channel: u16, method: Method) -> bool {
    let frame = MethodFrame::new(channel, method).into_frame().unwrap();
    send(stream, frame).await
}

async fn recv_or_pending(inject: &mut Option<mpsc::Receiver<Frame>>) -> Frame {
    match inject {
        Some(receiver) => match receiver.recv().await {
            Some(frame) => frame,
            None => {
                *inject = None;
                std::future::pending::<Frame>().await
            }
        },
        None => std::future::pending::<Frame>().await,
    }
}

async fn run_broker(
    mut stream: DuplexStream,
    behavior: BrokerBehavior,
    log: Arc<BrokerLog>,
    inject: mpsc::Receiver<Frame>,
) {
    let mut inject = Some(inject);

    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header, PROTOCOL_HEADER, "protocol header must come first");

    let start = Method::new(
        class_id::CONNECTION,
        connection_method::START,
        vec![
            Value::U8(0),
            Value::U8(9),
            Value::Table(server_properties()),
            Value::LongStr(behavior.mechanisms.into()),
            Value::LongStr("en_US en_GB".into()),
        ],
    )
    .unwrap();
    if !send_method(&mut stream, 0, start).await {
        return;
    }

    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            injected = recv_or_pending(&mut inject) => {
                if !send(&mut stream, injected).await {
                    return;
                }
            }
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for frame in frames.push(&buf[..n]).unwrap() {
                    if !handle_frame(&mut stream, frame, &behavior, &log).await {
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    stream: &mut DuplexStream,
    frame: Frame,
    behavior: &BrokerBehavior,
    log: &BrokerLog,
) -> bool {
    match frame.frame_type {
        FrameType::Heartbeat => {
            log.heartbeats.fetch_add(1, Ordering::Relaxed);
            if behavior.echo_heartbeats {
                return send(stream, Frame::heartbeat()).await;
            }
            true
        }
        FrameType::Body => {
            log.bodies.lock().unwrap().push(frame.payload.to_vec());
            true
        }
        FrameType::Method => {
            let method_frame = MethodFrame::parse(&frame).unwrap();
            let channel = method_frame.channel;
            let method = &method_frame.method;
            match (method.class_id(), method.method_id()) {
                (class_id::CONNECTION, connection_method::START_OK) => {
                    *log.start_ok.lock().unwrap() = Some((
                        method.arg_str("mechanism").unwrap().to_string(),
                        method.arg_str("locale").unwrap().to_string(),
                    ));
                    *log.client_capabilities.lock().unwrap() = method
                        .arg_table("client-properties")
                        .unwrap()
                        .get("capabilities")
                        .and_then(Value::as_table)
                        .cloned();
                    let (channel_max, frame_max, heartbeat) = behavior.tune;
                    send_method(
                        stream,
                        0,
                        Method::new(
                            class_id::CONNECTION,
                            connection_method::TUNE,
                            vec![
                                Value::U16(channel_max),
                                Value::U32(frame_max),
                                Value::U16(heartbeat),
                            ],
                        )
                        .unwrap(),
                    )
                    .await
                }
                (class_id::CONNECTION, connection_method::TUNE_OK) => {
                    *log.tune_ok.lock().unwrap() = Some((
                        method.arg_u16("channel-max").unwrap(),
                        method.arg_u32("frame-max").unwrap(),
                        method.arg_u16("heartbeat").unwrap(),
                    ));
                    true
                }
                (class_id::CONNECTION, connection_method::OPEN) => {
                    send_method(
                        stream,
                        0,
                        Method::new(
                            class_id::CONNECTION,
                            connection_method::OPEN_OK,
                            vec![Value::ShortStr(String::new())],
                        )
                        .unwrap(),
                    )
                    .await
                }
                (class_id::CONNECTION, connection_method::CLOSE) => {
                    log.connection_close.store(true, Ordering::Relaxed);
                    send_method(
                        stream,
                        0,
                        Method::new(class_id::CONNECTION, connection_method::CLOSE_OK, vec![])
                            .unwrap(),
                    )
                    .await
                }
                (class_id::CONNECTION, connection_method::CLOSE_OK) => true,
                (class_id::CHANNEL, channel_method::OPEN) => {
                    send_method(
                        stream,
                        channel,
                        Method::new(
                            class_id::CHANNEL,
                            channel_method::OPEN_OK,
                            vec![Value::LongStr(String::new())],
                        )
                        .unwrap(),
                    )
                    .await
                }
                (class_id::CHANNEL, channel_method::FLOW) => {
                    let active = method.arg_bool("active").unwrap();
                    send_method(
                        stream,
                        channel,
                        Method::new(
                            class_id::CHANNEL,
                            channel_method::FLOW_OK,
                            vec![Value::Bool(active)],
                        )
                        .unwrap(),
                    )
                    .await
                }
                (class_id::CHANNEL, channel_method::FLOW_OK) => {
                    let active = method.arg_bool("active").unwrap();
                    log.client_flow_ok.lock().unwrap().push((channel, active));
                    true
                }
                (class_id::CHANNEL, channel_method::CLOSE) => {
                    send_method(
                        stream,
                        channel,
                        Method::new(class_id::CHANNEL, channel_method::CLOSE_OK, vec![]).unwrap(),
                    )
                    .await
                }
                (class_id::CHANNEL, channel_method::CLOSE_OK) => {
                    log.channel_close_ok.lock().unwrap().push(channel);
                    true
                }
                _ => true,
            }
        }
        _ => true,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn connect(
    options: ConnectionOptions,
    behavior: BrokerBehavior,
) -> (Connection, TestBroker) {
    init_tracing();
    let (client_side, broker_side) = tokio::io::duplex(256 * 1024);
    let log = Arc::new(BrokerLog::default());
    let (inject_tx, inject_rx) = mpsc::channel(16);
    let handle = tokio::spawn(run_broker(broker_side, behavior, log.clone(), inject_rx));

    let connection = Connection::open_with_transport(options, client_side)
        .await
        .expect("open handshake");
    (
        connection,
        TestBroker {
            log,
            inject: inject_tx,
            handle,
        },
    )
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_protocol_header_written_first() {
    let (client_side, mut broker_side) = tokio::io::duplex(64 * 1024);
    let options = ConnectionOptions::new().with_connect_timeout(Duration::from_millis(200));
    let open = tokio::spawn(Connection::open_with_transport(options, client_side));

    let mut header = [0u8; 8];
    broker_side.read_exact(&mut header).await.unwrap();
    assert_eq!(header, [0x41, 0x4D, 0x51, 0x50, 0x00, 0x00, 0x09, 0x01]);

    // A silent broker means the handshake times out and the connection
    // ends up Closed.
    let result = open.await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_open_handshake() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;

    assert!(connection.is_open());
    assert_eq!(
        connection.server_properties().get("product"),
        Some(&Value::LongStr("MockBroker".into()))
    );

    let (mechanism, locale) = broker.log.start_ok.lock().unwrap().clone().unwrap();
    assert_eq!(mechanism, "AMQPLAIN");
    assert_eq!(locale, "en_US");

    connection.close().await.unwrap();
    assert_eq!(connection.state(), EndpointState::Closed);
    assert!(broker.log.connection_close.load(Ordering::Relaxed));
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_tune_negotiation() {
    let options = ConnectionOptions::new()
        .with_channel_max(256)
        .with_frame_max(0)
        .with_heartbeat(30);
    let behavior = BrokerBehavior {
        tune: (2048, 131072, 60),
        ..Default::default()
    };
    let (connection, broker) = connect(options, behavior).await;

    // Per-field minimum, zero meaning no preference.
    assert_eq!(
        broker.log.tune_ok.lock().unwrap().unwrap(),
        (256, 131072, 30)
    );
    let tuned = connection.tune_params();
    assert_eq!(tuned.channel_max, 256);
    assert_eq!(tuned.frame_max, 131072);
    assert_eq!(tuned.heartbeat, 30);

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_capability_echo() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;

    // The broker advertised both capabilities; start-ok must echo them
    // inside the client capabilities table.
    let echoed = broker.log.client_capabilities.lock().unwrap().clone().unwrap();
    assert_eq!(echoed.get("consumer_cancel_notify"), Some(&Value::Bool(true)));
    assert_eq!(echoed.get("connection.blocked"), Some(&Value::Bool(true)));

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_auth_mechanism_not_offered() {
    let (client_side, broker_side) = tokio::io::duplex(64 * 1024);
    let log = Arc::new(BrokerLog::default());
    let (_inject_tx, inject_rx) = mpsc::channel(16);
    let behavior = BrokerBehavior {
        mechanisms: "EXTERNAL",
        ..Default::default()
    };
    tokio::spawn(run_broker(broker_side, behavior, log, inject_rx));

    let options = ConnectionOptions::new().with_connect_timeout(Duration::from_secs(2));
    let result = Connection::open_with_transport(options, client_side).await;
    let error = result.err().expect("handshake must fail");
    assert!(error.to_string().contains("mechanism"));
}

#[tokio::test]
async fn test_channel_open_and_close() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;

    let channel = connection.channel(None).await.unwrap();
    assert_eq!(channel.id(), 1);
    assert!(channel.is_open());
    assert!(channel.flow_active());

    channel.close().await.unwrap();
    assert_eq!(channel.state(), EndpointState::Closed);

    // The id is free again once the channel left the map.
    let channel = connection.channel(None).await.unwrap();
    assert_eq!(channel.id(), 1);

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_channel_auto_assignment() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;

    let one = connection.channel(Some(1)).await.unwrap();
    let three = connection.channel(Some(3)).await.unwrap();
    assert_eq!(one.id(), 1);
    assert_eq!(three.id(), 3);

    // {0, 1, 3} in use: the first unused id is 2.
    let auto = connection.channel(None).await.unwrap();
    assert_eq!(auto.id(), 2);

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_channel_id_misuse() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;

    let _one = connection.channel(Some(1)).await.unwrap();
    assert!(connection.channel(Some(1)).await.is_err());
    assert!(connection.channel(Some(0)).await.is_err());
    assert!(connection.channel(Some(60_000)).await.is_err());

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_of_one_channel() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;

    let one = connection.channel(Some(1)).await.unwrap();
    let two = connection.channel(Some(2)).await.unwrap();

    let close = Method::new(
        class_id::CHANNEL,
        channel_method::CLOSE,
        vec![
            Value::U16(406),
            Value::ShortStr("PRECONDITION_FAILED".into()),
            Value::U16(60),
            Value::U16(40),
        ],
    )
    .unwrap();
    broker
        .inject
        .send(MethodFrame::new(2, close).into_frame().unwrap())
        .await
        .unwrap();

    wait_until("channel 2 closed", || two.state() == EndpointState::Closed).await;

    let reason = two.close_reason().unwrap();
    assert_eq!(reason.reply_code, 406);
    assert_eq!(reason.reply_text, "PRECONDITION_FAILED");
    assert_eq!(reason.class_id, 60);
    assert_eq!(reason.method_id, 40);

    // The client acknowledged, and everything else stays open.
    wait_until("close-ok for channel 2", || {
        broker.log.channel_close_ok.lock().unwrap().contains(&2)
    })
    .await;
    assert!(one.is_open());
    assert!(connection.is_open());

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_of_connection() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;
    let channel = connection.channel(None).await.unwrap();

    let close = Method::new(
        class_id::CONNECTION,
        connection_method::CLOSE,
        vec![
            Value::U16(320),
            Value::ShortStr("CONNECTION_FORCED".into()),
            Value::U16(0),
            Value::U16(0),
        ],
    )
    .unwrap();
    broker
        .inject
        .send(MethodFrame::new(0, close).into_frame().unwrap())
        .await
        .unwrap();

    wait_until("connection closed", || {
        connection.state() == EndpointState::Closed
    })
    .await;

    let reason = connection.close_reason().unwrap();
    assert_eq!(reason.reply_code, 320);
    assert_eq!(reason.reply_text, "CONNECTION_FORCED");
    assert_eq!(channel.state(), EndpointState::Closed);

    // Negotiated parameters are reset on teardown.
    assert_eq!(connection.tune_params().frame_max, 0);
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_flow_request_and_ack() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;
    let channel = connection.channel(None).await.unwrap();

    channel.flow(false).await.unwrap();
    assert!(!channel.flow_active());

    channel.flow(true).await.unwrap();
    assert!(channel.flow_active());

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_peer_initiated_flow() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;
    let channel = connection.channel(None).await.unwrap();

    let flow = Method::new(class_id::CHANNEL, channel_method::FLOW, vec![Value::Bool(false)])
        .unwrap();
    broker
        .inject
        .send(MethodFrame::new(1, flow).into_frame().unwrap())
        .await
        .unwrap();

    wait_until("flow flag updated", || !channel.flow_active()).await;
    wait_until("flow-ok sent back", || {
        broker
            .log
            .client_flow_ok
            .lock()
            .unwrap()
            .contains(&(1, false))
    })
    .await;

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_outbound_ordering_across_producers() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;
    let _channel = connection.channel(Some(1)).await.unwrap();

    let connection = Arc::new(connection);
    let mut producers = Vec::new();
    for tag in [b'a', b'b'] {
        let connection = connection.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..50u8 {
                let frame = Frame::new(
                    FrameType::Body,
                    1,
                    bytes::Bytes::from(vec![tag, i]),
                );
                connection.send_frame(frame).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    wait_until("all bodies received", || {
        broker.log.bodies.lock().unwrap().len() == 100
    })
    .await;

    // Whatever the interleaving, each producer's frames reach the wire in
    // enqueue order.
    let bodies = broker.log.bodies.lock().unwrap().clone();
    for tag in [b'a', b'b'] {
        let sequence: Vec<u8> = bodies
            .iter()
            .filter(|body| body[0] == tag)
            .map(|body| body[1])
            .collect();
        let expected: Vec<u8> = (0..50).collect();
        assert_eq!(sequence, expected, "producer {} reordered", tag as char);
    }

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_heartbeats_emitted_when_idle() {
    let options = ConnectionOptions::new().with_heartbeat(1);
    let behavior = BrokerBehavior {
        tune: (0, 0, 1),
        ..Default::default()
    };
    let (connection, broker) = connect(options, behavior).await;
    assert_eq!(connection.tune_params().heartbeat, 1);

    // Idle for a few intervals; the broker echoes heartbeats so the link
    // stays alive.
    tokio::time::sleep(Duration::from_millis(3600)).await;
    assert!(connection.is_open());
    assert!(broker.log.heartbeats.load(Ordering::Relaxed) >= 2);

    connection.close().await.unwrap();
    broker.handle.await.unwrap();
}

#[tokio::test]
async fn test_missed_heartbeats_tear_down() {
    let options = ConnectionOptions::new().with_heartbeat(1);
    let behavior = BrokerBehavior {
        tune: (0, 0, 1),
        echo_heartbeats: false,
        ..Default::default()
    };
    let (connection, _broker) = connect(options, behavior).await;

    // Nothing inbound after the handshake: two silent intervals and the
    // connection declares the peer dead.
    wait_until("connection closed by heartbeater", || {
        connection.state() == EndpointState::Closed
    })
    .await;
}

#[tokio::test]
async fn test_closed_connection_rejects_use() {
    let (connection, broker) = connect(ConnectionOptions::default(), BrokerBehavior::default()).await;
    connection.close().await.unwrap();

    assert!(connection.channel(None).await.is_err());
    assert!(connection.send_frame(Frame::heartbeat()).await.is_err());
    broker.handle.await.unwrap();
}
