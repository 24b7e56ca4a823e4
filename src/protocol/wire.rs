//! The wire value codec.
//!
//! Payloads are encoded in a curated subset of MessagePack: unsigned
//! integers, booleans, nil, UTF-8 strings, binary blobs, string-keyed maps
//! and arrays. [`WireWriter`] always emits the shortest legal encoding;
//! [`WireReader`] accepts every legal encoding for a value, so an `id` field
//! arriving as fixint, uint8, uint16, uint32 or uint64 is equally valid.

use std::io::Write;

use byteorder::{NetworkEndian, WriteBytesExt};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use super::ProtocolError;

/// The fixed (non-range) marker bytes of the supported MessagePack subset.
///
/// Fixint (`0x00..=0x7f`), fixmap (`0x80..=0x8f`), fixarray (`0x90..=0x9f`)
/// and fixstr (`0xa0..=0xbf`) occupy byte ranges and are matched separately.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum Marker {
    /// `nil`.
    Nil = 0xc0,
    /// `false`.
    False = 0xc2,
    /// `true`.
    True = 0xc3,
    /// Binary blob, 8-bit length.
    Bin8 = 0xc4,
    /// Binary blob, 16-bit length.
    Bin16 = 0xc5,
    /// Binary blob, 32-bit length.
    Bin32 = 0xc6,
    /// Unsigned 8-bit integer.
    Uint8 = 0xcc,
    /// Unsigned 16-bit integer.
    Uint16 = 0xcd,
    /// Unsigned 32-bit integer.
    Uint32 = 0xce,
    /// Unsigned 64-bit integer.
    Uint64 = 0xcf,
    /// String, 8-bit length.
    Str8 = 0xd9,
    /// String, 16-bit length.
    Str16 = 0xda,
    /// String, 32-bit length.
    Str32 = 0xdb,
    /// Array, 16-bit count.
    Array16 = 0xdc,
    /// Array, 32-bit count.
    Array32 = 0xdd,
    /// Map, 16-bit count.
    Map16 = 0xde,
    /// Map, 32-bit count.
    Map32 = 0xdf,
}

/// The broad kind of the next value in a reader, independent of its width.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    /// `nil`.
    Nil,
    /// A boolean.
    Bool,
    /// An unsigned integer of any width.
    Uint,
    /// A string of any length encoding.
    Str,
    /// A binary blob of any length encoding.
    Bin,
    /// An array of any count encoding.
    Array,
    /// A map of any count encoding.
    Map,
}

fn classify(b: u8) -> Result<Kind, ProtocolError> {
    match b {
        0x00..=0x7f => Ok(Kind::Uint),
        0x80..=0x8f => Ok(Kind::Map),
        0x90..=0x9f => Ok(Kind::Array),
        0xa0..=0xbf => Ok(Kind::Str),
        _ => match Marker::from_u8(b) {
            Some(Marker::Nil) => Ok(Kind::Nil),
            Some(Marker::False | Marker::True) => Ok(Kind::Bool),
            Some(Marker::Uint8 | Marker::Uint16 | Marker::Uint32 | Marker::Uint64) => {
                Ok(Kind::Uint)
            }
            Some(Marker::Str8 | Marker::Str16 | Marker::Str32) => Ok(Kind::Str),
            Some(Marker::Bin8 | Marker::Bin16 | Marker::Bin32) => Ok(Kind::Bin),
            Some(Marker::Array16 | Marker::Array32) => Ok(Kind::Array),
            Some(Marker::Map16 | Marker::Map32) => Ok(Kind::Map),
            None => Err(ProtocolError::MalformedValue(format!(
                "unsupported marker 0x{b:02x}"
            ))),
        },
    }
}

/// Position-based zero-copy reader for untrusted payload bytes.
///
/// The data is parsed and validated on the fly; strings and blobs are
/// returned as slices borrowing from the payload buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader over a complete frame payload.
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn next(&mut self) -> Result<u8, ProtocolError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::MalformedValue(
                "unexpected end of payload".into(),
            ));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn be_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn be_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn be_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn len_to_usize(n: u64) -> Result<usize, ProtocolError> {
        usize::try_from(n).map_err(|_| ProtocolError::MalformedValue("length overflow".into()))
    }

    /// Peeks at the next marker byte without consuming it.
    pub fn peek(&self) -> Result<u8, ProtocolError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| ProtocolError::MalformedValue("unexpected end of payload".into()))
    }

    /// Classifies the next value without consuming it.
    pub fn peek_kind(&self) -> Result<Kind, ProtocolError> {
        classify(self.peek()?)
    }

    /// True while any payload bytes remain.
    pub fn has_data_left(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Reads a `nil`.
    pub fn read_nil(&mut self) -> Result<(), ProtocolError> {
        let b = self.next()?;
        if b == Marker::Nil as u8 {
            Ok(())
        } else {
            Err(ProtocolError::MalformedValue(format!(
                "expected nil, got marker 0x{b:02x}"
            )))
        }
    }

    /// Reads a boolean.
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        let b = self.next()?;
        match Marker::from_u8(b) {
            Some(Marker::True) => Ok(true),
            Some(Marker::False) => Ok(false),
            _ => Err(ProtocolError::MalformedValue(format!(
                "expected boolean, got marker 0x{b:02x}"
            ))),
        }
    }

    /// Reads an unsigned integer of any width into a `u64`.
    pub fn read_uint(&mut self) -> Result<u64, ProtocolError> {
        let b = self.next()?;
        if b <= 0x7f {
            return Ok(u64::from(b));
        }
        match Marker::from_u8(b) {
            Some(Marker::Uint8) => Ok(u64::from(self.take(1)?[0])),
            Some(Marker::Uint16) => Ok(u64::from(self.be_u16()?)),
            Some(Marker::Uint32) => Ok(u64::from(self.be_u32()?)),
            Some(Marker::Uint64) => self.be_u64(),
            _ => Err(ProtocolError::MalformedValue(format!(
                "expected unsigned integer, got marker 0x{b:02x}"
            ))),
        }
    }

    /// Reads a string, returning a slice borrowing from the payload.
    pub fn read_str(&mut self) -> Result<&'a str, ProtocolError> {
        let b = self.next()?;
        let len = match b {
            0xa0..=0xbf => usize::from(b & 0x1f),
            _ => match Marker::from_u8(b) {
                Some(Marker::Str8) => usize::from(self.take(1)?[0]),
                Some(Marker::Str16) => usize::from(self.be_u16()?),
                Some(Marker::Str32) => Self::len_to_usize(u64::from(self.be_u32()?))?,
                _ => {
                    return Err(ProtocolError::MalformedValue(format!(
                        "expected string, got marker 0x{b:02x}"
                    )))
                }
            },
        };
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::MalformedValue("invalid UTF-8 in string".into()))
    }

    /// Reads a binary blob, returning a slice borrowing from the payload.
    pub fn read_bin(&mut self) -> Result<&'a [u8], ProtocolError> {
        let b = self.next()?;
        let len = match Marker::from_u8(b) {
            Some(Marker::Bin8) => usize::from(self.take(1)?[0]),
            Some(Marker::Bin16) => usize::from(self.be_u16()?),
            Some(Marker::Bin32) => Self::len_to_usize(u64::from(self.be_u32()?))?,
            _ => {
                return Err(ProtocolError::MalformedValue(format!(
                    "expected binary, got marker 0x{b:02x}"
                )))
            }
        };
        self.take(len)
    }

    /// Reads a map header, returning the entry count.
    pub fn read_map_header(&mut self) -> Result<usize, ProtocolError> {
        let b = self.next()?;
        match b {
            0x80..=0x8f => Ok(usize::from(b & 0x0f)),
            _ => match Marker::from_u8(b) {
                Some(Marker::Map16) => Ok(usize::from(self.be_u16()?)),
                Some(Marker::Map32) => Self::len_to_usize(u64::from(self.be_u32()?)),
                _ => Err(ProtocolError::MalformedValue(format!(
                    "expected map, got marker 0x{b:02x}"
                ))),
            },
        }
    }

    /// Reads an array header, returning the element count.
    pub fn read_array_header(&mut self) -> Result<usize, ProtocolError> {
        let b = self.next()?;
        match b {
            0x90..=0x9f => Ok(usize::from(b & 0x0f)),
            _ => match Marker::from_u8(b) {
                Some(Marker::Array16) => Ok(usize::from(self.be_u16()?)),
                Some(Marker::Array32) => Self::len_to_usize(u64::from(self.be_u32()?)),
                _ => Err(ProtocolError::MalformedValue(format!(
                    "expected array, got marker 0x{b:02x}"
                ))),
            },
        }
    }

    /// Advances past exactly one well-formed value of any supported type.
    ///
    /// Used to tolerate unknown keys in maps.
    pub fn skip_value(&mut self) -> Result<(), ProtocolError> {
        match self.peek_kind()? {
            Kind::Nil => self.read_nil(),
            Kind::Bool => self.read_bool().map(drop),
            Kind::Uint => self.read_uint().map(drop),
            Kind::Str => self.read_str().map(drop),
            Kind::Bin => self.read_bin().map(drop),
            Kind::Array => {
                let n = self.read_array_header()?;
                for _ in 0..n {
                    self.skip_value()?;
                }
                Ok(())
            }
            Kind::Map => {
                let n = self.read_map_header()?;
                for _ in 0..n {
                    self.skip_value()?;
                    self.skip_value()?;
                }
                Ok(())
            }
        }
    }
}

/// Streaming writer emitting the minimum-width encoding for every value.
pub struct WireWriter<'a> {
    inner: &'a mut dyn Write,
}

impl std::fmt::Debug for WireWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireWriter").finish_non_exhaustive()
    }
}

impl<'a> WireWriter<'a> {
    /// Creates a writer over any byte sink, typically a `Vec<u8>`.
    pub fn new(inner: &'a mut dyn Write) -> Self {
        WireWriter { inner }
    }

    /// Writes a `nil`.
    pub fn write_nil(&mut self) -> Result<(), ProtocolError> {
        self.inner.write_u8(Marker::Nil as u8)?;
        Ok(())
    }

    /// Writes a boolean.
    pub fn write_bool(&mut self, v: bool) -> Result<(), ProtocolError> {
        self.inner.write_u8(if v {
            Marker::True as u8
        } else {
            Marker::False as u8
        })?;
        Ok(())
    }

    /// Writes an unsigned integer using the narrowest legal encoding.
    pub fn write_uint(&mut self, v: u64) -> Result<(), ProtocolError> {
        if v <= 0x7f {
            self.inner.write_u8(v as u8)?;
        } else if v <= u64::from(u8::MAX) {
            self.inner.write_u8(Marker::Uint8 as u8)?;
            self.inner.write_u8(v as u8)?;
        } else if v <= u64::from(u16::MAX) {
            self.inner.write_u8(Marker::Uint16 as u8)?;
            self.inner.write_u16::<NetworkEndian>(v as u16)?;
        } else if v <= u64::from(u32::MAX) {
            self.inner.write_u8(Marker::Uint32 as u8)?;
            self.inner.write_u32::<NetworkEndian>(v as u32)?;
        } else {
            self.inner.write_u8(Marker::Uint64 as u8)?;
            self.inner.write_u64::<NetworkEndian>(v)?;
        }
        Ok(())
    }

    /// Writes a string using the narrowest legal length encoding.
    pub fn write_str(&mut self, v: &str) -> Result<(), ProtocolError> {
        let len = v.len();
        assert!(len <= u32::MAX as usize);
        if len < 32 {
            self.inner.write_u8(0xa0 | len as u8)?;
        } else if len <= usize::from(u8::MAX) {
            self.inner.write_u8(Marker::Str8 as u8)?;
            self.inner.write_u8(len as u8)?;
        } else if len <= usize::from(u16::MAX) {
            self.inner.write_u8(Marker::Str16 as u8)?;
            self.inner.write_u16::<NetworkEndian>(len as u16)?;
        } else {
            self.inner.write_u8(Marker::Str32 as u8)?;
            self.inner.write_u32::<NetworkEndian>(len as u32)?;
        }
        self.inner.write_all(v.as_bytes())?;
        Ok(())
    }

    /// Writes a binary blob using the narrowest legal length encoding.
    pub fn write_bin(&mut self, v: &[u8]) -> Result<(), ProtocolError> {
        let len = v.len();
        assert!(len <= u32::MAX as usize);
        if len <= usize::from(u8::MAX) {
            self.inner.write_u8(Marker::Bin8 as u8)?;
            self.inner.write_u8(len as u8)?;
        } else if len <= usize::from(u16::MAX) {
            self.inner.write_u8(Marker::Bin16 as u8)?;
            self.inner.write_u16::<NetworkEndian>(len as u16)?;
        } else {
            self.inner.write_u8(Marker::Bin32 as u8)?;
            self.inner.write_u32::<NetworkEndian>(len as u32)?;
        }
        self.inner.write_all(v)?;
        Ok(())
    }

    /// Writes a map header. The caller must emit exactly `count` key/value
    /// pairs afterwards; this is not validated.
    pub fn write_map_header(&mut self, count: usize) -> Result<(), ProtocolError> {
        assert!(count <= u32::MAX as usize);
        if count < 16 {
            self.inner.write_u8(0x80 | count as u8)?;
        } else if count <= usize::from(u16::MAX) {
            self.inner.write_u8(Marker::Map16 as u8)?;
            self.inner.write_u16::<NetworkEndian>(count as u16)?;
        } else {
            self.inner.write_u8(Marker::Map32 as u8)?;
            self.inner.write_u32::<NetworkEndian>(count as u32)?;
        }
        Ok(())
    }

    /// Writes an array header. The caller must emit exactly `count` elements
    /// afterwards; this is not validated.
    pub fn write_array_header(&mut self, count: usize) -> Result<(), ProtocolError> {
        assert!(count <= u32::MAX as usize);
        if count < 16 {
            self.inner.write_u8(0x90 | count as u8)?;
        } else if count <= usize::from(u16::MAX) {
            self.inner.write_u8(Marker::Array16 as u8)?;
            self.inner.write_u16::<NetworkEndian>(count as u16)?;
        } else {
            self.inner.write_u8(Marker::Array32 as u8)?;
            self.inner.write_u32::<NetworkEndian>(count as u32)?;
        }
        Ok(())
    }
}

/// A decoded value of the supported subset.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `nil`.
    Nil,
    /// A boolean.
    Bool(bool),
    /// An unsigned integer.
    Uint(u64),
    /// A UTF-8 string.
    Str(String),
    /// A binary blob.
    Bin(Vec<u8>),
    /// An array of values.
    Array(Vec<Value>),
    /// An ordered string-keyed map.
    Map(Map),
}

impl Value {
    /// Writes the value in its encoded form.
    pub fn write(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        match self {
            Value::Nil => w.write_nil(),
            Value::Bool(v) => w.write_bool(*v),
            Value::Uint(v) => w.write_uint(*v),
            Value::Str(v) => w.write_str(v),
            Value::Bin(v) => w.write_bin(v),
            Value::Array(vs) => {
                w.write_array_header(vs.len())?;
                for v in vs {
                    v.write(w)?;
                }
                Ok(())
            }
            Value::Map(m) => m.write(w),
        }
    }

    /// Reads one value of any supported type.
    pub fn read(r: &mut WireReader<'_>) -> Result<Value, ProtocolError> {
        match r.peek_kind()? {
            Kind::Nil => {
                r.read_nil()?;
                Ok(Value::Nil)
            }
            Kind::Bool => Ok(Value::Bool(r.read_bool()?)),
            Kind::Uint => Ok(Value::Uint(r.read_uint()?)),
            Kind::Str => Ok(Value::Str(r.read_str()?.to_owned())),
            Kind::Bin => Ok(Value::Bin(r.read_bin()?.to_vec())),
            Kind::Array => {
                let n = r.read_array_header()?;
                let mut vs = Vec::with_capacity(n.min(256));
                for _ in 0..n {
                    vs.push(Value::read(r)?);
                }
                Ok(Value::Array(vs))
            }
            Kind::Map => Ok(Value::Map(Map::read(r)?)),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(u64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bin(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Map> for Value {
    fn from(v: Map) -> Self {
        Value::Map(v)
    }
}

/// An ordered string-keyed map of [`Value`]s.
///
/// This is the generic representation used at the message-layer seam for
/// request arguments and response data; the command layer projects it into
/// strongly-typed structs. Missing keys read as zero values, per the
/// forward-compatibility rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Map(Vec<(String, Value)>);

impl Map {
    /// Creates an empty map.
    pub fn new() -> Self {
        Map(Vec::new())
    }

    /// Appends a key/value pair.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.push((key.to_owned(), value.into()));
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Looks up a key, returning the first match.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Reads an unsigned integer field, zero when absent or mistyped.
    pub fn uint(&self, key: &str) -> u64 {
        match self.get(key) {
            Some(Value::Uint(v)) => *v,
            _ => 0,
        }
    }

    /// Reads an unsigned integer field and narrows it to `u32`.
    pub fn uint32(&self, key: &str) -> Result<u32, ProtocolError> {
        u32::try_from(self.uint(key)).map_err(|_| {
            ProtocolError::MalformedMessage(format!("field {key:?} exceeds 32 bits"))
        })
    }

    /// Reads a boolean field, false when absent or mistyped.
    pub fn boolean(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    /// Reads a string field, empty when absent or mistyped.
    pub fn text(&self, key: &str) -> &str {
        match self.get(key) {
            Some(Value::Str(v)) => v,
            _ => "",
        }
    }

    /// Reads a binary field, empty when absent or mistyped.
    pub fn bin(&self, key: &str) -> &[u8] {
        match self.get(key) {
            Some(Value::Bin(v)) => v,
            _ => &[],
        }
    }

    /// Reads an array field, empty when absent or mistyped.
    pub fn array(&self, key: &str) -> &[Value] {
        match self.get(key) {
            Some(Value::Array(v)) => v,
            _ => &[],
        }
    }

    /// Writes the map in its encoded form.
    pub fn write(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        w.write_map_header(self.0.len())?;
        for (k, v) in &self.0 {
            w.write_str(k)?;
            v.write(w)?;
        }
        Ok(())
    }

    /// Reads a complete map.
    pub fn read(r: &mut WireReader<'_>) -> Result<Map, ProtocolError> {
        let n = r.read_map_header()?;
        let mut m = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            let k = r.read_str()?.to_owned();
            let v = Value::read(r)?;
            m.push((k, v));
        }
        Ok(Map(m))
    }
}
