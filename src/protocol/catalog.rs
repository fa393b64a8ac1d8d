//! Static method catalog.
//!
//! The catalog is the single source of truth for method payload layout: per
//! class its numeric id and name, per method its id, name, ordered argument
//! schema and (for request/response pairs) the name of the expected reply.
//! Payload parsing and construction are driven entirely from these tables,
//! including bit grouping: consecutive `Bit` arguments share packed octets.
//!
//! The tables are process-wide read-only constants; the by-name index is
//! built once on first use.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Wire type of a method argument or content property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Packed bit.
    Bit,
    /// Unsigned octet.
    Octet,
    /// Unsigned 16-bit.
    Short,
    /// Unsigned 32-bit.
    Long,
    /// Unsigned 64-bit.
    Longlong,
    /// Short string (one-octet length).
    Shortstr,
    /// Long string (four-octet length).
    Longstr,
    /// Field table.
    Table,
    /// 64-bit POSIX timestamp.
    Timestamp,
}

/// One argument in a method schema.
#[derive(Debug)]
pub struct ArgDef {
    pub name: &'static str,
    pub ty: ArgType,
}

/// One method descriptor.
#[derive(Debug)]
pub struct MethodDef {
    pub id: u16,
    pub name: &'static str,
    pub args: &'static [ArgDef],
    /// Reply method name for request/response pairs.
    pub response: Option<&'static str>,
}

/// One class descriptor.
#[derive(Debug)]
pub struct ClassDef {
    pub id: u16,
    pub name: &'static str,
    pub methods: &'static [MethodDef],
}

/// One content property in a class property list.
#[derive(Debug)]
pub struct PropertyDef {
    pub name: &'static str,
    /// Position in the property-flags word.
    pub bit: u16,
    pub ty: ArgType,
}

const fn arg(name: &'static str, ty: ArgType) -> ArgDef {
    ArgDef { name, ty }
}

const fn method(
    id: u16,
    name: &'static str,
    args: &'static [ArgDef],
    response: Option<&'static str>,
) -> MethodDef {
    MethodDef {
        id,
        name,
        args,
        response,
    }
}

/// Class ids.
pub mod class_id {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
    pub const CONFIRM: u16 = 85;
    pub const TX: u16 = 90;
}

/// Connection class method ids.
pub mod connection {
    pub const START: u16 = 10;
    pub const START_OK: u16 = 11;
    pub const SECURE: u16 = 20;
    pub const SECURE_OK: u16 = 21;
    pub const TUNE: u16 = 30;
    pub const TUNE_OK: u16 = 31;
    pub const OPEN: u16 = 40;
    pub const OPEN_OK: u16 = 41;
    pub const CLOSE: u16 = 50;
    pub const CLOSE_OK: u16 = 51;
    pub const BLOCKED: u16 = 60;
    pub const UNBLOCKED: u16 = 61;
}

/// Channel class method ids.
pub mod channel {
    pub const OPEN: u16 = 10;
    pub const OPEN_OK: u16 = 11;
    pub const FLOW: u16 = 20;
    pub const FLOW_OK: u16 = 21;
    pub const CLOSE: u16 = 40;
    pub const CLOSE_OK: u16 = 41;
}

use self::ArgType::*;

static CONNECTION_METHODS: &[MethodDef] = &[
    method(
        connection::START,
        "start",
        &[
            arg("version-major", Octet),
            arg("version-minor", Octet),
            arg("server-properties", Table),
            arg("mechanisms", Longstr),
            arg("locales", Longstr),
        ],
        Some("start-ok"),
    ),
    method(
        connection::START_OK,
        "start-ok",
        &[
            arg("client-properties", Table),
            arg("mechanism", Shortstr),
            arg("response", Longstr),
            arg("locale", Shortstr),
        ],
        None,
    ),
    method(
        connection::SECURE,
        "secure",
        &[arg("challenge", Longstr)],
        Some("secure-ok"),
    ),
    method(
        connection::SECURE_OK,
        "secure-ok",
        &[arg("response", Longstr)],
        None,
    ),
    method(
        connection::TUNE,
        "tune",
        &[
            arg("channel-max", Short),
            arg("frame-max", Long),
            arg("heartbeat", Short),
        ],
        Some("tune-ok"),
    ),
    method(
        connection::TUNE_OK,
        "tune-ok",
        &[
            arg("channel-max", Short),
            arg("frame-max", Long),
            arg("heartbeat", Short),
        ],
        None,
    ),
    method(
        connection::OPEN,
        "open",
        &[
            arg("virtual-host", Shortstr),
            arg("capabilities", Shortstr),
            arg("insist", Bit),
        ],
        Some("open-ok"),
    ),
    method(
        connection::OPEN_OK,
        "open-ok",
        &[arg("known-hosts", Shortstr)],
        None,
    ),
    method(
        connection::CLOSE,
        "close",
        &[
            arg("reply-code", Short),
            arg("reply-text", Shortstr),
            arg("class-id", Short),
            arg("method-id", Short),
        ],
        Some("close-ok"),
    ),
    method(connection::CLOSE_OK, "close-ok", &[], None),
    method(connection::BLOCKED, "blocked", &[arg("reason", Shortstr)], None),
    method(connection::UNBLOCKED, "unblocked", &[], None),
];

static CHANNEL_METHODS: &[MethodDef] = &[
    method(
        channel::OPEN,
        "open",
        &[arg("out-of-band", Shortstr)],
        Some("open-ok"),
    ),
    method(
        channel::OPEN_OK,
        "open-ok",
        &[arg("channel-id", Longstr)],
        None,
    ),
    method(channel::FLOW, "flow", &[arg("active", Bit)], Some("flow-ok")),
    method(channel::FLOW_OK, "flow-ok", &[arg("active", Bit)], None),
    method(
        channel::CLOSE,
        "close",
        &[
            arg("reply-code", Short),
            arg("reply-text", Shortstr),
            arg("class-id", Short),
            arg("method-id", Short),
        ],
        Some("close-ok"),
    ),
    method(channel::CLOSE_OK, "close-ok", &[], None),
];

static EXCHANGE_METHODS: &[MethodDef] = &[
    method(
        10,
        "declare",
        &[
            arg("ticket", Short),
            arg("exchange", Shortstr),
            arg("type", Shortstr),
            arg("passive", Bit),
            arg("durable", Bit),
            arg("auto-delete", Bit),
            arg("internal", Bit),
            arg("no-wait", Bit),
            arg("arguments", Table),
        ],
        Some("declare-ok"),
    ),
    method(11, "declare-ok", &[], None),
    method(
        20,
        "delete",
        &[
            arg("ticket", Short),
            arg("exchange", Shortstr),
            arg("if-unused", Bit),
            arg("no-wait", Bit),
        ],
        Some("delete-ok"),
    ),
    method(21, "delete-ok", &[], None),
];

static QUEUE_METHODS: &[MethodDef] = &[
    method(
        10,
        "declare",
        &[
            arg("ticket", Short),
            arg("queue", Shortstr),
            arg("passive", Bit),
            arg("durable", Bit),
            arg("exclusive", Bit),
            arg("auto-delete", Bit),
            arg("no-wait", Bit),
            arg("arguments", Table),
        ],
        Some("declare-ok"),
    ),
    method(
        11,
        "declare-ok",
        &[
            arg("queue", Shortstr),
            arg("message-count", Long),
            arg("consumer-count", Long),
        ],
        None,
    ),
    method(
        20,
        "bind",
        &[
            arg("ticket", Short),
            arg("queue", Shortstr),
            arg("exchange", Shortstr),
            arg("routing-key", Shortstr),
            arg("no-wait", Bit),
            arg("arguments", Table),
        ],
        Some("bind-ok"),
    ),
    method(21, "bind-ok", &[], None),
    method(
        30,
        "purge",
        &[arg("ticket", Short), arg("queue", Shortstr), arg("no-wait", Bit)],
        Some("purge-ok"),
    ),
    method(31, "purge-ok", &[arg("message-count", Long)], None),
    method(
        40,
        "delete",
        &[
            arg("ticket", Short),
            arg("queue", Shortstr),
            arg("if-unused", Bit),
            arg("if-empty", Bit),
            arg("no-wait", Bit),
        ],
        Some("delete-ok"),
    ),
    method(41, "delete-ok", &[arg("message-count", Long)], None),
    method(
        50,
        "unbind",
        &[
            arg("ticket", Short),
            arg("queue", Shortstr),
            arg("exchange", Shortstr),
            arg("routing-key", Shortstr),
            arg("arguments", Table),
        ],
        Some("unbind-ok"),
    ),
    method(51, "unbind-ok", &[], None),
];

static BASIC_METHODS: &[MethodDef] = &[
    method(
        10,
        "qos",
        &[
            arg("prefetch-size", Long),
            arg("prefetch-count", Short),
            arg("global", Bit),
        ],
        Some("qos-ok"),
    ),
    method(11, "qos-ok", &[], None),
    method(
        20,
        "consume",
        &[
            arg("ticket", Short),
            arg("queue", Shortstr),
            arg("consumer-tag", Shortstr),
            arg("no-local", Bit),
            arg("no-ack", Bit),
            arg("exclusive", Bit),
            arg("no-wait", Bit),
            arg("arguments", Table),
        ],
        Some("consume-ok"),
    ),
    method(21, "consume-ok", &[arg("consumer-tag", Shortstr)], None),
    method(
        30,
        "cancel",
        &[arg("consumer-tag", Shortstr), arg("no-wait", Bit)],
        Some("cancel-ok"),
    ),
    method(31, "cancel-ok", &[arg("consumer-tag", Shortstr)], None),
    method(
        40,
        "publish",
        &[
            arg("ticket", Short),
            arg("exchange", Shortstr),
            arg("routing-key", Shortstr),
            arg("mandatory", Bit),
            arg("immediate", Bit),
        ],
        None,
    ),
    method(
        50,
        "return",
        &[
            arg("reply-code", Short),
            arg("reply-text", Shortstr),
            arg("exchange", Shortstr),
            arg("routing-key", Shortstr),
        ],
        None,
    ),
    method(
        60,
        "deliver",
        &[
            arg("consumer-tag", Shortstr),
            arg("delivery-tag", Longlong),
            arg("redelivered", Bit),
            arg("exchange", Shortstr),
            arg("routing-key", Shortstr),
        ],
        None,
    ),
    method(
        70,
        "get",
        &[arg("ticket", Short), arg("queue", Shortstr), arg("no-ack", Bit)],
        Some("get-ok"),
    ),
    method(
        71,
        "get-ok",
        &[
            arg("delivery-tag", Longlong),
            arg("redelivered", Bit),
            arg("exchange", Shortstr),
            arg("routing-key", Shortstr),
            arg("message-count", Long),
        ],
        None,
    ),
    method(72, "get-empty", &[arg("cluster-id", Shortstr)], None),
    method(
        80,
        "ack",
        &[arg("delivery-tag", Longlong), arg("multiple", Bit)],
        None,
    ),
    method(
        90,
        "reject",
        &[arg("delivery-tag", Longlong), arg("requeue", Bit)],
        None,
    ),
    method(100, "recover-async", &[arg("requeue", Bit)], None),
    method(110, "recover", &[arg("requeue", Bit)], Some("recover-ok")),
    method(111, "recover-ok", &[], None),
    method(
        120,
        "nack",
        &[
            arg("delivery-tag", Longlong),
            arg("multiple", Bit),
            arg("requeue", Bit),
        ],
        None,
    ),
];

static CONFIRM_METHODS: &[MethodDef] = &[
    method(10, "select", &[arg("nowait", Bit)], Some("select-ok")),
    method(11, "select-ok", &[], None),
];

static TX_METHODS: &[MethodDef] = &[
    method(10, "select", &[], Some("select-ok")),
    method(11, "select-ok", &[], None),
    method(20, "commit", &[], Some("commit-ok")),
    method(21, "commit-ok", &[], None),
    method(30, "rollback", &[], Some("rollback-ok")),
    method(31, "rollback-ok", &[], None),
];

/// All classes, in id order.
pub static CLASSES: &[ClassDef] = &[
    ClassDef {
        id: class_id::CONNECTION,
        name: "connection",
        methods: CONNECTION_METHODS,
    },
    ClassDef {
        id: class_id::CHANNEL,
        name: "channel",
        methods: CHANNEL_METHODS,
    },
    ClassDef {
        id: class_id::EXCHANGE,
        name: "exchange",
        methods: EXCHANGE_METHODS,
    },
    ClassDef {
        id: class_id::QUEUE,
        name: "queue",
        methods: QUEUE_METHODS,
    },
    ClassDef {
        id: class_id::BASIC,
        name: "basic",
        methods: BASIC_METHODS,
    },
    ClassDef {
        id: class_id::CONFIRM,
        name: "confirm",
        methods: CONFIRM_METHODS,
    },
    ClassDef {
        id: class_id::TX,
        name: "tx",
        methods: TX_METHODS,
    },
];

/// Content properties of the basic class, in wire order. The flag word
/// selects which are present; properties always appear in this order.
pub static BASIC_PROPERTIES: &[PropertyDef] = &[
    PropertyDef { name: "content-type", bit: 15, ty: Shortstr },
    PropertyDef { name: "content-encoding", bit: 14, ty: Shortstr },
    PropertyDef { name: "headers", bit: 13, ty: Table },
    PropertyDef { name: "delivery-mode", bit: 12, ty: Octet },
    PropertyDef { name: "priority", bit: 11, ty: Octet },
    PropertyDef { name: "correlation-id", bit: 10, ty: Shortstr },
    PropertyDef { name: "reply-to", bit: 9, ty: Shortstr },
    PropertyDef { name: "expiration", bit: 8, ty: Shortstr },
    PropertyDef { name: "message-id", bit: 7, ty: Shortstr },
    PropertyDef { name: "timestamp", bit: 6, ty: Timestamp },
    PropertyDef { name: "type", bit: 5, ty: Shortstr },
    PropertyDef { name: "user-id", bit: 4, ty: Shortstr },
    PropertyDef { name: "app-id", bit: 3, ty: Shortstr },
    PropertyDef { name: "cluster-id", bit: 2, ty: Shortstr },
];

/// Look up a class by id.
pub fn class(class_id: u16) -> Option<&'static ClassDef> {
    CLASSES.iter().find(|c| c.id == class_id)
}

/// Look up a method by (class id, method id).
pub fn lookup(class_id: u16, method_id: u16) -> Option<(&'static ClassDef, &'static MethodDef)> {
    let class = class(class_id)?;
    let method = class.methods.iter().find(|m| m.id == method_id)?;
    Some((class, method))
}

fn name_index() -> &'static HashMap<&'static str, &'static ClassDef> {
    static INDEX: OnceLock<HashMap<&'static str, &'static ClassDef>> = OnceLock::new();
    INDEX.get_or_init(|| CLASSES.iter().map(|c| (c.name, c)).collect())
}

/// Look up a class by name.
pub fn class_by_name(name: &str) -> Option<&'static ClassDef> {
    name_index().get(name).copied()
}

/// Look up a method by (class name, method name).
pub fn lookup_by_name(
    class_name: &str,
    method_name: &str,
) -> Option<(&'static ClassDef, &'static MethodDef)> {
    let class = class_by_name(class_name)?;
    let method = class.methods.iter().find(|m| m.name == method_name)?;
    Some((class, method))
}
