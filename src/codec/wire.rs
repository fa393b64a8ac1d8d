//! Wire-level reads and writes.
//!
//! [`WireReader`] consumes a borrowed payload slice; [`WireWriter`] stages
//! into a `BytesMut`. All multi-byte integers are big-endian. Both sides
//! implement bit packing for consecutive bit arguments: a staging octet and
//! a position counter in `[0..7]`, flushed by the first non-bit field and
//! after the eighth bit.
//!
//! Tables and arrays are length-prefixed with a four-octet byte count. The
//! writer emits a placeholder, serializes in place, then backfills the real
//! count; the reader parses a bounded view until it is exhausted.

use bytes::{BufMut, Bytes, BytesMut};

use super::value::{check_short_str, unknown_tag, FieldTable, Value};
use crate::error::{AmqwireError, Result};

fn truncated(what: &str) -> AmqwireError {
    AmqwireError::Protocol(format!("truncated payload while reading {what}"))
}

/// Reader over a single frame payload.
pub struct WireReader<'a> {
    data: &'a [u8],
    bits: u8,
    bit_pos: u8,
}

impl<'a> WireReader<'a> {
    /// Create a reader over a payload slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            bits: 0,
            bit_pos: 0,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    fn end_bits(&mut self) {
        self.bit_pos = 0;
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(truncated(what));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    /// Read one bit. Consumes a fresh octet when the position counter is at
    /// zero; the counter wraps back to zero after the eighth bit.
    pub fn read_bit(&mut self) -> Result<bool> {
        if self.bit_pos == 0 {
            self.bits = self.take(1, "bit")?[0];
        }
        let bit = (self.bits >> self.bit_pos) & 1 != 0;
        self.bit_pos = (self.bit_pos + 1) % 8;
        Ok(bit)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.end_bits();
        Ok(self.take(1, "u8")?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.end_bits();
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.end_bits();
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.end_bits();
        let b = self.take(8, "u64")?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read a short string: one-octet length, then exactly that many bytes.
    pub fn read_short_str(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len, "short string")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| AmqwireError::Protocol("invalid UTF-8 in short string".into()))
    }

    /// Read a long string: four-octet length, then exactly that many bytes.
    pub fn read_long_str(&mut self) -> Result<String> {
        let bytes = self.read_long_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| AmqwireError::Protocol("invalid UTF-8 in long string".into()))
    }

    /// Read a long byte string.
    pub fn read_long_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len, "long string")?.to_vec())
    }

    /// Read a field table: a bounded view parsed to exhaustion.
    pub fn read_table(&mut self) -> Result<FieldTable> {
        let len = self.read_u32()? as usize;
        let view = self.take(len, "field table")?;
        let mut sub = WireReader::new(view);
        let mut table = FieldTable::new();
        while sub.remaining() > 0 {
            let name = sub.read_short_str()?;
            let tag = sub.read_u8()?;
            let value = sub.read_value(tag)?;
            table.insert(name, value);
        }
        Ok(table)
    }

    /// Read a field array: a bounded view of tagged values.
    pub fn read_array(&mut self) -> Result<Vec<Value>> {
        let len = self.read_u32()? as usize;
        let view = self.take(len, "field array")?;
        let mut sub = WireReader::new(view);
        let mut values = Vec::new();
        while sub.remaining() > 0 {
            let tag = sub.read_u8()?;
            values.push(sub.read_value(tag)?);
        }
        Ok(values)
    }

    /// Read the value for a type tag already consumed.
    pub fn read_value(&mut self, tag: u8) -> Result<Value> {
        match tag {
            b't' => Ok(Value::Bool(self.read_u8()? != 0)),
            b'b' => Ok(Value::I8(self.read_i8()?)),
            b'B' => Ok(Value::U8(self.read_u8()?)),
            b'U' => Ok(Value::I16(self.read_i16()?)),
            // `s` is an alias tag for unsigned 16-bit in this alphabet.
            b'u' | b's' => Ok(Value::U16(self.read_u16()?)),
            b'I' => Ok(Value::I32(self.read_i32()?)),
            b'i' => Ok(Value::U32(self.read_u32()?)),
            b'L' => Ok(Value::I64(self.read_i64()?)),
            b'l' => Ok(Value::U64(self.read_u64()?)),
            b'f' => Ok(Value::F32(self.read_f32()?)),
            b'd' => Ok(Value::F64(self.read_f64()?)),
            b'D' => Ok(Value::Decimal {
                scale: self.read_u8()?,
                value: self.read_u32()?,
            }),
            b'S' => Ok(Value::LongStr(self.read_long_str()?)),
            b'x' => Ok(Value::Bytes(self.read_long_bytes()?)),
            b'T' => Ok(Value::Timestamp(self.read_u64()?)),
            b'A' => Ok(Value::Array(self.read_array()?)),
            b'F' => Ok(Value::Table(self.read_table()?)),
            b'V' => Ok(Value::Void),
            other => Err(unknown_tag(other)),
        }
    }
}

/// Writer staging into a growable buffer.
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
    bit_pos: u8,
    bit_at: usize,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            bit_pos: 0,
            bit_at: 0,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and freeze the staged bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn end_bits(&mut self) {
        self.bit_pos = 0;
    }

    /// Write one bit into the staging octet at the current position. The
    /// octet is appended when the first bit of a group is written and
    /// updated in place for the rest; the position wraps after eight bits.
    pub fn write_bit(&mut self, value: bool) {
        if self.bit_pos == 0 {
            self.bit_at = self.buf.len();
            self.buf.put_u8(0);
        }
        if value {
            self.buf[self.bit_at] |= 1 << self.bit_pos;
        }
        self.bit_pos = (self.bit_pos + 1) % 8;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.end_bits();
        self.buf.put_u8(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.end_bits();
        self.buf.put_u16(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_u16(value as u16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.end_bits();
        self.buf.put_u32(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.end_bits();
        self.buf.put_u64(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// Write a short string: length octet then payload. Errors when the
    /// string does not fit the one-octet length prefix.
    pub fn write_short_str(&mut self, value: &str) -> Result<()> {
        check_short_str(value)?;
        self.end_bits();
        self.buf.put_u8(value.len() as u8);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    /// Write a long string.
    pub fn write_long_str(&mut self, value: &str) {
        self.write_long_bytes(value.as_bytes());
    }

    /// Write a long byte string.
    pub fn write_long_bytes(&mut self, value: &[u8]) {
        self.end_bits();
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    fn backfill_u32(&mut self, at: usize) {
        let len = (self.buf.len() - at - 4) as u32;
        self.buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Write a field table: length placeholder, pairs, backfilled count.
    pub fn write_table(&mut self, table: &FieldTable) -> Result<()> {
        self.end_bits();
        let at = self.buf.len();
        self.buf.put_u32(0);
        for (name, value) in table.iter() {
            self.write_short_str(name)?;
            self.write_value(value)?;
        }
        self.backfill_u32(at);
        Ok(())
    }

    /// Write a field array.
    pub fn write_array(&mut self, values: &[Value]) -> Result<()> {
        self.end_bits();
        let at = self.buf.len();
        self.buf.put_u32(0);
        for value in values {
            self.write_value(value)?;
        }
        self.backfill_u32(at);
        Ok(())
    }

    /// Write a tagged value (tag octet followed by its payload).
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        self.end_bits();
        if let Value::ShortStr(_) = value {
            // Short strings are not a table value kind; the `s` tag carries
            // u16 in this alphabet.
            return Err(AmqwireError::Client(
                "short strings cannot be encoded as field values".into(),
            ));
        }
        self.buf.put_u8(value.tag());
        match value {
            Value::Bool(v) => self.write_u8(*v as u8),
            Value::I8(v) => self.write_i8(*v),
            Value::U8(v) => self.write_u8(*v),
            Value::I16(v) => self.write_i16(*v),
            Value::U16(v) => self.write_u16(*v),
            Value::I32(v) => self.write_i32(*v),
            Value::U32(v) => self.write_u32(*v),
            Value::I64(v) => self.write_i64(*v),
            Value::U64(v) => self.write_u64(*v),
            Value::F32(v) => self.write_f32(*v),
            Value::F64(v) => self.write_f64(*v),
            Value::Decimal { scale, value } => {
                self.write_u8(*scale);
                self.write_u32(*value);
            }
            Value::LongStr(v) => self.write_long_str(v),
            Value::Bytes(v) => self.write_long_bytes(v),
            Value::Timestamp(v) => self.write_u64(*v),
            Value::Array(v) => self.write_array(v)?,
            Value::Table(v) => self.write_table(v)?,
            Value::Void | Value::ShortStr(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_str_bytes() {
        let mut w = WireWriter::new();
        w.write_short_str("hello").unwrap();
        assert_eq!(&w.finish()[..], &[0x05, 0x68, 0x65, 0x6C, 0x6C, 0x6F]);
    }

    #[test]
    fn test_short_str_roundtrip() {
        let mut w = WireWriter::new();
        w.write_short_str("hello").unwrap();
        let bytes = w.finish();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_short_str().unwrap(), "hello");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_single_pair_table_bytes() {
        let mut table = FieldTable::new();
        table.insert("ok", Value::Bool(true));

        let mut w = WireWriter::new();
        w.write_table(&table).unwrap();
        assert_eq!(
            &w.finish()[..],
            &[0x00, 0x00, 0x00, 0x05, 0x02, 0x6F, 0x6B, 0x74, 0x01]
        );
    }

    #[test]
    fn test_table_roundtrip_all_kinds() {
        let mut inner = FieldTable::new();
        inner.insert("nested", Value::I32(-7));

        let mut table = FieldTable::new();
        table.insert("t", Value::Bool(false));
        table.insert("b", Value::I8(-1));
        table.insert("B", Value::U8(200));
        table.insert("U", Value::I16(-300));
        table.insert("u", Value::U16(300));
        table.insert("I", Value::I32(-70000));
        table.insert("i", Value::U32(70000));
        table.insert("L", Value::I64(-5_000_000_000));
        table.insert("l", Value::U64(5_000_000_000));
        table.insert("f", Value::F32(1.5));
        table.insert("d", Value::F64(-2.25));
        table.insert("D", Value::Decimal { scale: 2, value: 12345 });
        table.insert("S", Value::LongStr("long".into()));
        table.insert("x", Value::Bytes(vec![0, 1, 2, 0xFF]));
        table.insert("T", Value::Timestamp(1_700_000_000));
        table.insert("A", Value::Array(vec![Value::U8(1), Value::Void]));
        table.insert("F", Value::Table(inner.clone()));
        table.insert("V", Value::Void);

        let mut w = WireWriter::new();
        w.write_table(&table).unwrap();
        let bytes = w.finish();

        // The length field covers exactly the pair sequence.
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(declared, bytes.len() - 4);

        let mut r = WireReader::new(&bytes);
        let decoded = r.read_table().unwrap();
        assert_eq!(decoded, table);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_reencoding_is_exact() {
        let mut table = FieldTable::new();
        table.insert("first", Value::U32(1));
        table.insert("second", Value::LongStr("two".into()));

        let mut w = WireWriter::new();
        w.write_table(&table).unwrap();
        let once = w.finish();

        let decoded = WireReader::new(&once).read_table().unwrap();
        let mut w2 = WireWriter::new();
        w2.write_table(&decoded).unwrap();
        assert_eq!(&once[..], &w2.finish()[..]);
    }

    #[test]
    fn test_bit_packing_lsb_first() {
        let mut w = WireWriter::new();
        w.write_bit(true);
        w.write_bit(false);
        w.write_bit(true);
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[0b0000_0101]);
    }

    #[test]
    fn test_bits_flushed_by_non_bit() {
        let mut w = WireWriter::new();
        w.write_bit(true);
        w.write_u8(0x42);
        w.write_bit(true);
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[0x01, 0x42, 0x01]);
    }

    #[test]
    fn test_nine_bits_use_two_octets() {
        let mut w = WireWriter::new();
        for i in 0..9 {
            w.write_bit(i % 2 == 0);
        }
        let bytes = w.finish();
        assert_eq!(bytes.len(), 2);
        assert_eq!(bytes[0], 0b0101_0101);
        assert_eq!(bytes[1], 0b0000_0001);

        let mut r = WireReader::new(&bytes);
        for i in 0..9 {
            assert_eq!(r.read_bit().unwrap(), i % 2 == 0, "bit {i}");
        }
    }

    #[test]
    fn test_read_bit_position_resets_after_eighth() {
        // Two octets of bits; the ninth read must consume the second octet
        // rather than recycling stale positions.
        let bytes = [0xFF, 0x01];
        let mut r = WireReader::new(&bytes);
        for _ in 0..8 {
            assert!(r.read_bit().unwrap());
        }
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
    }

    #[test]
    fn test_non_bit_read_resets_bit_state() {
        let bytes = [0x01, 0x2A, 0x01];
        let mut r = WireReader::new(&bytes);
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_u8().unwrap(), 0x2A);
        assert!(r.read_bit().unwrap());
    }

    #[test]
    fn test_alias_tag_decodes_as_u16() {
        // name "n", tag 's', value 0x0102
        let bytes = [
            0x00, 0x00, 0x00, 0x05, 0x01, 0x6E, 0x73, 0x01, 0x02,
        ];
        let table = WireReader::new(&bytes).read_table().unwrap();
        assert_eq!(table.get("n"), Some(&Value::U16(0x0102)));
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        let bytes = [0x00, 0x00, 0x00, 0x03, 0x01, 0x6E, 0x7A];
        let err = WireReader::new(&bytes).read_table().unwrap_err();
        assert!(matches!(err, AmqwireError::Protocol(_)));
    }

    #[test]
    fn test_truncated_read_is_protocol_error() {
        let mut r = WireReader::new(&[0x00]);
        assert!(matches!(
            r.read_u32().unwrap_err(),
            AmqwireError::Protocol(_)
        ));
    }

    #[test]
    fn test_decimal_bytes() {
        let mut w = WireWriter::new();
        w.write_value(&Value::Decimal { scale: 2, value: 314 }).unwrap();
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[b'D', 0x02, 0x00, 0x00, 0x01, 0x3A]);
    }

    #[test]
    fn test_short_str_rejected_as_table_value() {
        let mut w = WireWriter::new();
        let err = w
            .write_value(&Value::ShortStr("no".into()))
            .unwrap_err();
        assert!(matches!(err, AmqwireError::Client(_)));
    }

    #[test]
    fn test_array_roundtrip() {
        let values = vec![
            Value::Bool(true),
            Value::LongStr("abc".into()),
            Value::U64(u64::MAX),
        ];
        let mut w = WireWriter::new();
        w.write_array(&values).unwrap();
        let bytes = w.finish();
        let decoded = WireReader::new(&bytes).read_array().unwrap();
        assert_eq!(decoded, values);
    }
}
