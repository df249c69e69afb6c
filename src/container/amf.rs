//! AMF0 script data
//!
//! FLV script tags carry AMF0-encoded values. Segment files only need a small
//! subset: the `onMetaData` name string followed by an ECMA array of numbers,
//! booleans and strings. Properties keep their insertion order so the muxer
//! can rewrite fixed-position numbers in place.
//!
//! Type Markers:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (associative array)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + timezone)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ContainerError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Maximum nesting depth for objects/arrays
const MAX_NESTING_DEPTH: usize = 16;

/// AMF0 value
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    /// Object or ECMA array, in wire order
    Object(Vec<(String, AmfValue)>),
    Array(Vec<AmfValue>),
    Null,
}

impl AmfValue {
    /// Look up a property of an object value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        match self {
            AmfValue::Object(props) => props.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Get current encoded length
    ///
    /// Taken right after writing a key, this is the offset of the value's
    /// type marker.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single AMF0 value
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.begin_ecma_array(props.len());
                for (key, val) in props {
                    self.write_key(key);
                    self.encode(val);
                }
                self.end_object();
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
        }
    }

    /// Start an ECMA array; follow with `write_key`/`encode` pairs and `end_object`
    pub fn begin_ecma_array(&mut self, count: usize) {
        self.buf.put_u8(MARKER_ECMA_ARRAY);
        self.buf.put_u32(count as u32);
    }

    /// Write a property key (no type marker)
    pub fn write_key(&mut self, key: &str) {
        let len = key.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&key.as_bytes()[..len]);
    }

    pub fn end_object(&mut self) {
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// AMF0 decoder
pub struct Amf0Decoder {
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Decode a single AMF0 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, ContainerError> {
        if buf.is_empty() {
            return Err(eof());
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ContainerError::Malformed("AMF nesting too deep".into()));
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode all values from buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, ContainerError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, ContainerError> {
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(eof());
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.is_empty() {
                    return Err(eof());
                }
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => self.decode_properties(buf),
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(eof());
                }
                // Count hint, not always accurate
                let _count = buf.get_u32();
                self.decode_properties(buf)
            }
            MARKER_STRICT_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(eof());
                }
                let count = buf.get_u32() as usize;
                let mut elements = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                Ok(AmfValue::Array(elements))
            }
            MARKER_DATE => {
                if buf.remaining() < 10 {
                    return Err(eof());
                }
                let timestamp = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Number(timestamp))
            }
            MARKER_NULL | MARKER_UNDEFINED => Ok(AmfValue::Null),
            other => Err(ContainerError::Malformed(format!(
                "unsupported AMF0 marker 0x{:02x}",
                other
            ))),
        }
    }

    fn decode_properties(&mut self, buf: &mut Bytes) -> Result<AmfValue, ContainerError> {
        let mut properties = Vec::new();

        loop {
            let key = read_utf8(buf)?;

            if key.is_empty() {
                // Some writers omit the end marker at the end of the tag
                if buf.has_remaining() && buf[0] == MARKER_OBJECT_END {
                    buf.advance(1);
                }
                break;
            }

            let value = self.decode(buf)?;
            properties.push((key, value));
        }

        Ok(AmfValue::Object(properties))
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn eof() -> ContainerError {
    ContainerError::Malformed("unexpected end of AMF data".into())
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut Bytes) -> Result<String, ContainerError> {
    if buf.remaining() < 2 {
        return Err(eof());
    }
    let len = buf.get_u16() as usize;
    read_utf8_bytes(buf, len)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut Bytes) -> Result<String, ContainerError> {
    if buf.remaining() < 4 {
        return Err(eof());
    }
    let len = buf.get_u32() as usize;
    read_utf8_bytes(buf, len)
}

fn read_utf8_bytes(buf: &mut Bytes, len: usize) -> Result<String, ContainerError> {
    if buf.remaining() < len {
        return Err(eof());
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ContainerError::Malformed("invalid UTF-8 in AMF string".into()))
}
