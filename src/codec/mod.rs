//! Codec module - the wire value model and its read/write routines.
//!
//! This module owns everything below the frame envelope:
//!
//! - [`Value`] / [`FieldTable`] - the tagged field-value model used by
//!   tables, arrays and method arguments
//! - [`WireReader`] / [`WireWriter`] - big-endian primitive reads and
//!   writes, length-prefixed strings, bounded tables, and bit packing
//!
//! # Example
//!
//! ```
//! use amqwire::codec::{FieldTable, Value, WireReader, WireWriter};
//!
//! let mut table = FieldTable::new();
//! table.insert("ok", Value::Bool(true));
//!
//! let mut writer = WireWriter::new();
//! writer.write_table(&table).unwrap();
//! let bytes = writer.finish();
//!
//! let decoded = WireReader::new(&bytes).read_table().unwrap();
//! assert_eq!(decoded, table);
//! ```

mod value;
mod wire;

pub use value::{FieldTable, Value};
pub use wire::{WireReader, WireWriter};
