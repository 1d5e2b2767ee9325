//! TUBV binary value format: versioned encoding for structured channel values.
//!
//! Layout:
//! ```text
//! [TUBV][version:2][type:1][reserved:1]   8-byte header
//! [tag:1][payload...]                     one tagged value
//!
//! tag 0 null    (no payload)
//! tag 1 bool    [b:1]
//! tag 2 int     [i64 BE]
//! tag 3 float   [f64 BE]
//! tag 4 str     [len:4][utf8:N]
//! tag 5 bytes   [len:4][data:N]
//! tag 6 list    [count:4][value...]
//! tag 7 map     [count:4]([key_len:4][key:N][value])...
//! tag 8 image   [h:4][w:4][c:1][len:4][pixels:N]
//! ```
//! All integers are big-endian. Decoding rejects trailing bytes.

use std::collections::BTreeMap;

use crate::errors::{Result, TubError};
use crate::frame::ImageArray;
use crate::value::Value;

pub const MAGIC: &[u8; 4] = b"TUBV";
pub const WIRE_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 8; // 4 (magic) + 2 (version) + 1 (type) + 1 (reserved)

const VALUE_RECORD_TYPE: u8 = 0x01;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;
const TAG_IMAGE: u8 = 8;

/// Nesting limit for lists and maps on decode.
const MAX_DEPTH: usize = 64;

/// Encode the value header.
pub fn encode_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&WIRE_VERSION.to_be_bytes());
    buf.push(VALUE_RECORD_TYPE);
    buf.push(0x00); // reserved
}

/// Encode a length-prefixed byte field with u32 (big-endian) length prefix.
pub fn encode_u32_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Serialize a value, header included.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    encode_header(&mut buf);
    encode_tagged(&mut buf, value);
    buf
}

fn encode_tagged(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(*b as u8);
        }
        Value::Int(i) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        Value::Str(s) => {
            buf.push(TAG_STR);
            encode_u32_prefixed(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            encode_u32_prefixed(buf, b);
        }
        Value::List(items) => {
            buf.push(TAG_LIST);
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_tagged(buf, item);
            }
        }
        Value::Map(map) => {
            buf.push(TAG_MAP);
            buf.extend_from_slice(&(map.len() as u32).to_be_bytes());
            for (k, v) in map {
                encode_u32_prefixed(buf, k.as_bytes());
                encode_tagged(buf, v);
            }
        }
        Value::Image(img) => {
            buf.push(TAG_IMAGE);
            buf.extend_from_slice(&img.height().to_be_bytes());
            buf.extend_from_slice(&img.width().to_be_bytes());
            buf.push(img.channels());
            encode_u32_prefixed(buf, img.data());
        }
    }
}

/// Deserialize a value produced by [`encode_value`].
pub fn decode_value(data: &[u8]) -> Result<Value> {
    let mut reader = WireReader::new(data);
    reader.read_header()?;
    let value = reader.read_value(0)?;
    if reader.remaining() > 0 {
        return Err(TubError::Wire(format!(
            "{} trailing bytes after value",
            reader.remaining()
        )));
    }
    Ok(value)
}

/// A cursor for reading wire-format bytes.
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(TubError::Wire(format!(
                "unexpected EOF at offset {}, need {} bytes",
                self.pos, n
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_array8(&mut self) -> Result<[u8; 8]> {
        let bytes = self.read_bytes(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array8()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_array8()?))
    }

    /// Read a field with u32 length prefix.
    pub fn read_u32_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_u32_prefixed()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| TubError::Wire(format!("invalid UTF-8 in string: {e}")))
    }

    /// Validate the wire header, returning (version, record_type).
    pub fn read_header(&mut self) -> Result<(u16, u8)> {
        let magic = self.read_bytes(4)?;
        if magic != MAGIC {
            return Err(TubError::Wire(format!("invalid magic: {:?}", magic)));
        }
        let version = self.read_u16()?;
        if version != WIRE_VERSION {
            return Err(TubError::Wire(format!(
                "unsupported wire version: {version}"
            )));
        }
        let rec_type = self.read_u8()?;
        if rec_type != VALUE_RECORD_TYPE {
            return Err(TubError::Wire(format!("unknown record type: {rec_type}")));
        }
        let _reserved = self.read_u8()?;
        Ok((version, rec_type))
    }

    /// Read one tagged value.
    pub fn read_value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(TubError::Wire(format!(
                "value nesting deeper than {MAX_DEPTH}"
            )));
        }
        let tag = self.read_u8()?;
        Ok(match tag {
            TAG_NULL => Value::Null,
            TAG_BOOL => match self.read_u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(TubError::Wire(format!("invalid bool byte: {other}"))),
            },
            TAG_INT => Value::Int(self.read_i64()?),
            TAG_FLOAT => Value::Float(self.read_f64()?),
            TAG_STR => Value::Str(self.read_string()?),
            TAG_BYTES => Value::Bytes(self.read_u32_prefixed()?.to_vec()),
            TAG_LIST => {
                let count = self.read_u32()? as usize;
                // Every element takes at least one byte.
                let mut items = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Value::List(items)
            }
            TAG_MAP => {
                let count = self.read_u32()? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = self.read_string()?;
                    let value = self.read_value(depth + 1)?;
                    map.insert(key, value);
                }
                Value::Map(map)
            }
            TAG_IMAGE => {
                let height = self.read_u32()?;
                let width = self.read_u32()?;
                let channels = self.read_u8()?;
                let pixels = self.read_u32_prefixed()?.to_vec();
                let img = ImageArray::new(height, width, channels, pixels)
                    .map_err(|e| TubError::Wire(format!("bad image payload: {e}")))?;
                Value::Image(img)
            }
            other => return Err(TubError::Wire(format!("unknown value tag: {other}"))),
        })
    }
}
