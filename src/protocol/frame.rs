//! Typed frames over the generic envelope.
//!
//! [`Method`] is a catalog-driven method payload: argument order, types and
//! bit grouping come from the schema in [`catalog`]. The four typed frames
//! ([`MethodFrame`], [`ContentHeaderFrame`], [`BodyFrame`],
//! [`HeartbeatFrame`]) convert to and from [`Frame`]; parsing asserts the
//! envelope's type byte, encoding recomputes the size field and stamps the
//! end sentinel.

use bytes::Bytes;

use super::catalog::{self, ArgType, MethodDef, BASIC_PROPERTIES};
use super::wire_format::{Frame, FrameType};
use crate::codec::{FieldTable, Value, WireReader, WireWriter};
use crate::error::{AmqwireError, Result};

fn wrong_frame_type(expected: FrameType, got: FrameType) -> AmqwireError {
    AmqwireError::Protocol(format!("expected {expected:?} frame, got {got:?}"))
}

/// A method payload: class id, method id, and arguments in schema order.
#[derive(Debug, Clone)]
pub struct Method {
    class_id: u16,
    method_id: u16,
    def: &'static MethodDef,
    args: Vec<Value>,
}

impl PartialEq for Method {
    fn eq(&self, other: &Self) -> bool {
        self.class_id == other.class_id
            && self.method_id == other.method_id
            && self.args == other.args
    }
}

impl Method {
    /// Build a method from numeric ids. The argument list must match the
    /// catalog schema in arity and kinds.
    pub fn new(class_id: u16, method_id: u16, args: Vec<Value>) -> Result<Self> {
        let (_, def) = catalog::lookup(class_id, method_id).ok_or_else(|| {
            AmqwireError::Protocol(format!("unknown method {class_id}.{method_id}"))
        })?;
        if args.len() != def.args.len() {
            return Err(AmqwireError::Client(format!(
                "{}: expected {} arguments, got {}",
                def.name,
                def.args.len(),
                args.len()
            )));
        }
        for (value, arg) in args.iter().zip(def.args) {
            if !kind_matches(arg.ty, value) {
                return Err(AmqwireError::Client(format!(
                    "{}: argument '{}' expects {:?}, got {}",
                    def.name,
                    arg.name,
                    arg.ty,
                    value.kind()
                )));
            }
        }
        Ok(Self {
            class_id,
            method_id,
            def,
            args,
        })
    }

    /// Build a method by class and method name.
    pub fn build(class_name: &str, method_name: &str, args: Vec<Value>) -> Result<Self> {
        let (class, def) = catalog::lookup_by_name(class_name, method_name).ok_or_else(|| {
            AmqwireError::Client(format!("unknown method {class_name}.{method_name}"))
        })?;
        Self::new(class.id, def.id, args)
    }

    /// Parse a method payload: `class:u16 | method:u16 | args…`, with the
    /// argument schema resolved from the catalog.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let class_id = r.read_u16()?;
        let method_id = r.read_u16()?;
        let (_, def) = catalog::lookup(class_id, method_id).ok_or_else(|| {
            AmqwireError::Protocol(format!("unknown method {class_id}.{method_id}"))
        })?;

        let mut args = Vec::with_capacity(def.args.len());
        for arg in def.args {
            let value = match arg.ty {
                ArgType::Bit => Value::Bool(r.read_bit()?),
                ArgType::Octet => Value::U8(r.read_u8()?),
                ArgType::Short => Value::U16(r.read_u16()?),
                ArgType::Long => Value::U32(r.read_u32()?),
                ArgType::Longlong => Value::U64(r.read_u64()?),
                ArgType::Shortstr => Value::ShortStr(r.read_short_str()?),
                ArgType::Longstr => match String::from_utf8(r.read_long_bytes()?) {
                    Ok(s) => Value::LongStr(s),
                    Err(e) => Value::Bytes(e.into_bytes()),
                },
                ArgType::Table => Value::Table(r.read_table()?),
                ArgType::Timestamp => Value::Timestamp(r.read_u64()?),
            };
            args.push(value);
        }
        if r.remaining() > 0 {
            return Err(AmqwireError::Protocol(format!(
                "{} bytes trailing after {} arguments",
                r.remaining(),
                def.name
            )));
        }
        Ok(Self {
            class_id,
            method_id,
            def,
            args,
        })
    }

    /// Encode the payload; consecutive bit arguments share packed octets.
    pub fn encode(&self) -> Result<Bytes> {
        let mut w = WireWriter::new();
        w.write_u16(self.class_id);
        w.write_u16(self.method_id);
        for (value, arg) in self.args.iter().zip(self.def.args) {
            match (arg.ty, value) {
                (ArgType::Bit, Value::Bool(v)) => w.write_bit(*v),
                (ArgType::Octet, Value::U8(v)) => w.write_u8(*v),
                (ArgType::Short, Value::U16(v)) => w.write_u16(*v),
                (ArgType::Long, Value::U32(v)) => w.write_u32(*v),
                (ArgType::Longlong, Value::U64(v)) => w.write_u64(*v),
                (ArgType::Shortstr, Value::ShortStr(v)) => w.write_short_str(v)?,
                (ArgType::Longstr, Value::LongStr(v)) => w.write_long_str(v),
                (ArgType::Longstr, Value::Bytes(v)) => w.write_long_bytes(v),
                (ArgType::Table, Value::Table(v)) => w.write_table(v)?,
                (ArgType::Timestamp, Value::Timestamp(v)) | (ArgType::Timestamp, Value::U64(v)) => {
                    w.write_u64(*v)
                }
                (ty, v) => {
                    return Err(AmqwireError::Client(format!(
                        "{}: argument '{}' expects {:?}, got {}",
                        self.def.name,
                        arg.name,
                        ty,
                        v.kind()
                    )))
                }
            }
        }
        Ok(w.finish())
    }

    pub fn class_id(&self) -> u16 {
        self.class_id
    }

    pub fn method_id(&self) -> u16 {
        self.method_id
    }

    /// Catalog descriptor for this method.
    pub fn def(&self) -> &'static MethodDef {
        self.def
    }

    /// Method name from the catalog.
    pub fn name(&self) -> &'static str {
        self.def.name
    }

    /// Expected reply method name, for request/response pairs.
    pub fn response(&self) -> Option<&'static str> {
        self.def.response
    }

    /// Arguments in schema order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Look up an argument by schema name.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        let idx = self.def.args.iter().position(|a| a.name == name)?;
        self.args.get(idx)
    }

    fn required(&self, name: &str) -> Result<&Value> {
        self.arg(name).ok_or_else(|| {
            AmqwireError::Protocol(format!("{}: missing argument '{name}'", self.def.name))
        })
    }

    /// Required u16 argument.
    pub fn arg_u16(&self, name: &str) -> Result<u16> {
        self.required(name)?
            .as_u16()
            .ok_or_else(|| self.kind_error(name, "u16"))
    }

    /// Required u32 argument.
    pub fn arg_u32(&self, name: &str) -> Result<u32> {
        self.required(name)?
            .as_u32()
            .ok_or_else(|| self.kind_error(name, "u32"))
    }

    /// Required bool argument.
    pub fn arg_bool(&self, name: &str) -> Result<bool> {
        self.required(name)?
            .as_bool()
            .ok_or_else(|| self.kind_error(name, "bool"))
    }

    /// Required string argument (either string kind).
    pub fn arg_str(&self, name: &str) -> Result<&str> {
        self.required(name)?
            .as_str()
            .ok_or_else(|| self.kind_error(name, "string"))
    }

    /// Required table argument.
    pub fn arg_table(&self, name: &str) -> Result<&FieldTable> {
        self.required(name)?
            .as_table()
            .ok_or_else(|| self.kind_error(name, "table"))
    }

    fn kind_error(&self, name: &str, expected: &str) -> AmqwireError {
        AmqwireError::Protocol(format!(
            "{}: argument '{name}' is not a {expected}",
            self.def.name
        ))
    }
}

fn kind_matches(ty: ArgType, value: &Value) -> bool {
    matches!(
        (ty, value),
        (ArgType::Bit, Value::Bool(_))
            | (ArgType::Octet, Value::U8(_))
            | (ArgType::Short, Value::U16(_))
            | (ArgType::Long, Value::U32(_))
            | (ArgType::Longlong, Value::U64(_))
            | (ArgType::Shortstr, Value::ShortStr(_))
            | (ArgType::Longstr, Value::LongStr(_))
            | (ArgType::Longstr, Value::Bytes(_))
            | (ArgType::Table, Value::Table(_))
            | (ArgType::Timestamp, Value::Timestamp(_))
            | (ArgType::Timestamp, Value::U64(_))
    )
}

/// A method frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodFrame {
    pub channel: u16,
    pub method: Method,
}

impl MethodFrame {
    pub fn new(channel: u16, method: Method) -> Self {
        Self { channel, method }
    }

    /// Parse from a generic frame; the type byte must be Method.
    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.frame_type != FrameType::Method {
            return Err(wrong_frame_type(FrameType::Method, frame.frame_type));
        }
        Ok(Self {
            channel: frame.channel,
            method: Method::parse(&frame.payload)?,
        })
    }

    /// Convert into a generic frame, re-encoding the payload.
    pub fn into_frame(self) -> Result<Frame> {
        Ok(Frame::new(
            FrameType::Method,
            self.channel,
            self.method.encode()?,
        ))
    }
}

/// Content properties of the basic class. The flag word selects which of
/// the fixed, ordered list are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

fn prop_flag(name: &str) -> u16 {
    BASIC_PROPERTIES
        .iter()
        .find(|p| p.name == name)
        .map(|p| 1 << p.bit)
        .unwrap_or(0)
}

impl BasicProperties {
    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        let flags = r.read_u16()?;
        let mut p = BasicProperties::default();
        let has = |name: &str| flags & prop_flag(name) != 0;

        if has("content-type") {
            p.content_type = Some(r.read_short_str()?);
        }
        if has("content-encoding") {
            p.content_encoding = Some(r.read_short_str()?);
        }
        if has("headers") {
            p.headers = Some(r.read_table()?);
        }
        if has("delivery-mode") {
            p.delivery_mode = Some(r.read_u8()?);
        }
        if has("priority") {
            p.priority = Some(r.read_u8()?);
        }
        if has("correlation-id") {
            p.correlation_id = Some(r.read_short_str()?);
        }
        if has("reply-to") {
            p.reply_to = Some(r.read_short_str()?);
        }
        if has("expiration") {
            p.expiration = Some(r.read_short_str()?);
        }
        if has("message-id") {
            p.message_id = Some(r.read_short_str()?);
        }
        if has("timestamp") {
            p.timestamp = Some(r.read_u64()?);
        }
        if has("type") {
            p.message_type = Some(r.read_short_str()?);
        }
        if has("user-id") {
            p.user_id = Some(r.read_short_str()?);
        }
        if has("app-id") {
            p.app_id = Some(r.read_short_str()?);
        }
        if has("cluster-id") {
            p.cluster_id = Some(r.read_short_str()?);
        }
        Ok(p)
    }

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        let mut flags = 0u16;
        let mut set = |present: bool, name: &str| {
            if present {
                flags |= prop_flag(name);
            }
        };
        set(self.content_type.is_some(), "content-type");
        set(self.content_encoding.is_some(), "content-encoding");
        set(self.headers.is_some(), "headers");
        set(self.delivery_mode.is_some(), "delivery-mode");
        set(self.priority.is_some(), "priority");
        set(self.correlation_id.is_some(), "correlation-id");
        set(self.reply_to.is_some(), "reply-to");
        set(self.expiration.is_some(), "expiration");
        set(self.message_id.is_some(), "message-id");
        set(self.timestamp.is_some(), "timestamp");
        set(self.message_type.is_some(), "type");
        set(self.user_id.is_some(), "user-id");
        set(self.app_id.is_some(), "app-id");
        set(self.cluster_id.is_some(), "cluster-id");
        w.write_u16(flags);

        if let Some(v) = &self.content_type {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.content_encoding {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.headers {
            w.write_table(v)?;
        }
        if let Some(v) = self.delivery_mode {
            w.write_u8(v);
        }
        if let Some(v) = self.priority {
            w.write_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.reply_to {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.expiration {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.message_id {
            w.write_short_str(v)?;
        }
        if let Some(v) = self.timestamp {
            w.write_u64(v);
        }
        if let Some(v) = &self.message_type {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.user_id {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.app_id {
            w.write_short_str(v)?;
        }
        if let Some(v) = &self.cluster_id {
            w.write_short_str(v)?;
        }
        Ok(())
    }
}

/// A content header frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeaderFrame {
    pub channel: u16,
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeaderFrame {
    /// Parse from a generic frame; the type byte must be Header. The weight
    /// field is read and ignored.
    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.frame_type != FrameType::Header {
            return Err(wrong_frame_type(FrameType::Header, frame.frame_type));
        }
        let mut r = WireReader::new(&frame.payload);
        let class_id = r.read_u16()?;
        let _weight = r.read_u16()?;
        let body_size = r.read_u64()?;
        let properties = BasicProperties::read(&mut r)?;
        Ok(Self {
            channel: frame.channel,
            class_id,
            body_size,
            properties,
        })
    }

    /// Convert into a generic frame; weight is always written as zero.
    pub fn into_frame(self) -> Result<Frame> {
        let mut w = WireWriter::new();
        w.write_u16(self.class_id);
        w.write_u16(0);
        w.write_u64(self.body_size);
        self.properties.write(&mut w)?;
        Ok(Frame::new(FrameType::Header, self.channel, w.finish()))
    }
}

/// A content body frame: raw opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyFrame {
    pub channel: u16,
    pub body: Bytes,
}

impl BodyFrame {
    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.frame_type != FrameType::Body {
            return Err(wrong_frame_type(FrameType::Body, frame.frame_type));
        }
        Ok(Self {
            channel: frame.channel,
            body: frame.payload.clone(),
        })
    }

    pub fn into_frame(self) -> Frame {
        Frame::new(FrameType::Body, self.channel, self.body)
    }
}

/// A heartbeat frame: empty payload, channel 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatFrame;

impl HeartbeatFrame {
    pub fn parse(frame: &Frame) -> Result<Self> {
        if frame.frame_type != FrameType::Heartbeat {
            return Err(wrong_frame_type(FrameType::Heartbeat, frame.frame_type));
        }
        Ok(HeartbeatFrame)
    }

    pub fn into_frame(self) -> Frame {
        Frame::heartbeat()
    }
}

/// Why a connection or channel was closed: the peer's reply code and text,
/// plus the offending class and method ids.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseReason {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseReason {
    /// Extract from a `connection.close` or `channel.close` method.
    pub fn from_method(method: &Method) -> Result<Self> {
        Ok(Self {
            reply_code: method.arg_u16("reply-code")?,
            reply_text: method.arg_str("reply-text")?.to_string(),
            class_id: method.arg_u16("class-id")?,
            method_id: method.arg_u16("method-id")?,
        })
    }
}
