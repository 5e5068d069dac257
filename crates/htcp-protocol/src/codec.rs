//! Binary codec for the self-describing value grammar.
//!
//! Every value starts with a 1-byte tag; composites recursively encode
//! their children.  All lengths and counts are 4-byte unsigned big-endian.
//! The tag assignments are byte-stable across implementations — changing
//! any of them is a wire break.

use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::WireError;
use crate::value::{EnumMember, Map, Record, Value};

/// Fixed tag bytes of the value grammar.
pub mod tag {
    pub const NULL: u8 = 0x00;
    pub const BOOL_TRUE: u8 = 0x01;
    pub const BOOL_FALSE: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const STR: u8 = 0x05;
    pub const BYTES: u8 = 0x06;
    pub const LIST: u8 = 0x07;
    pub const TUPLE: u8 = 0x08;
    pub const MAPPING: u8 = 0x09;
    pub const SET: u8 = 0x0A;
    pub const FROZEN_SET: u8 = 0x0B;
    pub const RECORD: u8 = 0x0C;
    pub const DATETIME: u8 = 0x0D;
    pub const DATE: u8 = 0x0E;
    pub const TIME: u8 = 0x0F;
    pub const DURATION: u8 = 0x10;
    pub const DECIMAL: u8 = 0x11;
    pub const COMPLEX: u8 = 0x12;
    pub const UUID: u8 = 0x13;
    pub const ENUM: u8 = 0x14;
    pub const INT_NEG: u8 = 0x15;
    pub const INT_BIG: u8 = 0x16;
    pub const INT_BIG_NEG: u8 = 0x17;
    pub const NAMED_RECORD: u8 = 0x18;
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a value to its self-describing byte form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, value);
    buf.to_vec()
}

/// Encode a value, appending to an existing buffer.
pub fn encode_into(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(tag::NULL),
        Value::Bool(true) => buf.put_u8(tag::BOOL_TRUE),
        Value::Bool(false) => buf.put_u8(tag::BOOL_FALSE),
        Value::Int(i) => encode_int(buf, i),
        Value::Float(f) => {
            buf.put_u8(tag::FLOAT);
            buf.put_f64(*f);
        }
        Value::Str(s) => {
            buf.put_u8(tag::STR);
            put_bytes(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(tag::BYTES);
            put_bytes(buf, b);
        }
        Value::List(items) => encode_sequence(buf, tag::LIST, items),
        Value::Tuple(items) => encode_sequence(buf, tag::TUPLE, items),
        Value::Set(items) => encode_sequence(buf, tag::SET, items),
        Value::FrozenSet(items) => encode_sequence(buf, tag::FROZEN_SET, items),
        Value::Mapping(map) => {
            buf.put_u8(tag::MAPPING);
            buf.put_u32(u32_len(map.len()));
            for (k, v) in map {
                encode_into(buf, k);
                encode_into(buf, v);
            }
        }
        Value::Record(record) => {
            buf.put_u8(tag::RECORD);
            put_bytes(buf, record.type_name.as_bytes());
            buf.put_u32(u32_len(record.fields.len()));
            for (name, field) in &record.fields {
                put_bytes(buf, name.as_bytes());
                encode_into(buf, field);
            }
        }
        Value::DateTime(dt) => {
            buf.put_u8(tag::DATETIME);
            put_bytes(buf, dt.to_rfc3339().as_bytes());
        }
        Value::Date(d) => {
            buf.put_u8(tag::DATE);
            put_bytes(buf, d.to_string().as_bytes());
        }
        Value::Time(t) => {
            buf.put_u8(tag::TIME);
            put_bytes(buf, t.to_string().as_bytes());
        }
        Value::Duration(d) => {
            buf.put_u8(tag::DURATION);
            buf.put_f64(duration_seconds(d));
        }
        Value::Decimal(d) => {
            buf.put_u8(tag::DECIMAL);
            put_bytes(buf, d.to_string().as_bytes());
        }
        Value::Complex { re, im } => {
            buf.put_u8(tag::COMPLEX);
            buf.put_f64(*re);
            buf.put_f64(*im);
        }
        Value::Uuid(u) => {
            buf.put_u8(tag::UUID);
            buf.put_slice(u.as_bytes());
        }
        Value::Enum(e) => {
            buf.put_u8(tag::ENUM);
            put_bytes(buf, e.type_name.as_bytes());
            put_bytes(buf, e.member.as_bytes());
        }
    }
}

/// i64-range integers take the compact 8-byte signed form; everything
/// larger is a length-prefixed magnitude with the sign carried by the tag.
fn encode_int(buf: &mut BytesMut, i: &BigInt) {
    if let Some(v) = i.to_i64() {
        buf.put_u8(if v >= 0 { tag::INT } else { tag::INT_NEG });
        buf.put_i64(v);
    } else {
        let (sign, magnitude) = i.to_bytes_be();
        buf.put_u8(if sign == Sign::Minus {
            tag::INT_BIG_NEG
        } else {
            tag::INT_BIG
        });
        put_bytes(buf, &magnitude);
    }
}

fn encode_sequence(buf: &mut BytesMut, t: u8, items: &[Value]) {
    buf.put_u8(t);
    buf.put_u32(u32_len(items.len()));
    for item in items {
        encode_into(buf, item);
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(u32_len(data.len()));
    buf.put_slice(data);
}

fn u32_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or_else(|_| panic!("length {len} exceeds wire limit"))
}

fn duration_seconds(d: &TimeDelta) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => d.num_milliseconds() as f64 / 1e3,
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a single value occupying the whole buffer.
pub fn decode(data: &[u8]) -> Result<Value, WireError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed < data.len() {
        return Err(WireError::TrailingBytes(data.len() - consumed));
    }
    Ok(value)
}

/// Decode a single value from the front of the buffer; returns the value
/// and the number of bytes consumed.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), WireError> {
    if data.is_empty() {
        return Err(WireError::EmptyInput);
    }
    let mut reader = Reader { data, pos: 0 };
    let value = read_value(&mut reader)?;
    Ok((value, reader.pos))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<usize, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_be_bytes(raw))
    }

    fn str(&mut self, what: &'static str) -> Result<&'a str, WireError> {
        let len = self.u32()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(what))
    }
}

fn read_value(r: &mut Reader<'_>) -> Result<Value, WireError> {
    let t = r.u8()?;
    match t {
        tag::NULL => Ok(Value::Null),
        tag::BOOL_TRUE => Ok(Value::Bool(true)),
        tag::BOOL_FALSE => Ok(Value::Bool(false)),
        tag::INT | tag::INT_NEG => Ok(Value::Int(BigInt::from(r.i64()?))),
        tag::INT_BIG | tag::INT_BIG_NEG => {
            let len = r.u32()?;
            let magnitude = r.take(len)?;
            let mut i = BigInt::from_bytes_be(Sign::Plus, magnitude);
            if t == tag::INT_BIG_NEG {
                i = -i;
            }
            Ok(Value::Int(i))
        }
        tag::FLOAT => Ok(Value::Float(r.f64()?)),
        tag::STR => Ok(Value::Str(r.str("string")?.to_owned())),
        tag::BYTES => {
            let len = r.u32()?;
            Ok(Value::Bytes(r.take(len)?.to_vec()))
        }
        tag::LIST => Ok(Value::List(read_sequence(r)?)),
        tag::TUPLE => Ok(Value::Tuple(read_sequence(r)?)),
        tag::SET => Ok(Value::set(read_sequence(r)?)),
        tag::FROZEN_SET => Ok(Value::frozen_set(read_sequence(r)?)),
        tag::MAPPING => {
            let count = r.u32()?;
            let mut map = Map::with_capacity(count.min(r.remaining()));
            for _ in 0..count {
                let key = read_value(r)?;
                let value = read_value(r)?;
                map.insert(key, value);
            }
            Ok(Value::Mapping(map))
        }
        tag::RECORD | tag::NAMED_RECORD => {
            let type_name = r.str("record type name")?.to_owned();
            let count = r.u32()?;
            let mut record = Record::new(type_name);
            for _ in 0..count {
                let name = r.str("record field name")?.to_owned();
                let value = read_value(r)?;
                record.fields.insert(name, value);
            }
            Ok(Value::Record(record))
        }
        tag::DATETIME => {
            let s = r.str("datetime")?;
            Ok(Value::DateTime(parse_datetime(s)?))
        }
        tag::DATE => {
            let s = r.str("date")?;
            let d = NaiveDate::from_str(s).map_err(|e| WireError::InvalidValue {
                what: "date",
                detail: e.to_string(),
            })?;
            Ok(Value::Date(d))
        }
        tag::TIME => {
            let s = r.str("time")?;
            let t = NaiveTime::from_str(s).map_err(|e| WireError::InvalidValue {
                what: "time",
                detail: e.to_string(),
            })?;
            Ok(Value::Time(t))
        }
        tag::DURATION => {
            let seconds = r.f64()?;
            if !seconds.is_finite() {
                return Err(WireError::InvalidValue {
                    what: "duration",
                    detail: format!("non-finite seconds: {seconds}"),
                });
            }
            Ok(Value::Duration(TimeDelta::microseconds(
                (seconds * 1e6).round() as i64,
            )))
        }
        tag::DECIMAL => {
            let s = r.str("decimal")?;
            let d = Decimal::from_str(s).map_err(|e| WireError::InvalidValue {
                what: "decimal",
                detail: e.to_string(),
            })?;
            Ok(Value::Decimal(d))
        }
        tag::COMPLEX => {
            let re = r.f64()?;
            let im = r.f64()?;
            Ok(Value::Complex { re, im })
        }
        tag::UUID => {
            let bytes = r.take(16)?;
            let u = Uuid::from_slice(bytes).map_err(|e| WireError::InvalidValue {
                what: "uuid",
                detail: e.to_string(),
            })?;
            Ok(Value::Uuid(u))
        }
        tag::ENUM => {
            let type_name = r.str("enum type name")?.to_owned();
            let member = r.str("enum member name")?.to_owned();
            Ok(Value::Enum(EnumMember { type_name, member }))
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

fn read_sequence(r: &mut Reader<'_>) -> Result<Vec<Value>, WireError> {
    let count = r.u32()?;
    let mut items = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        items.push(read_value(r)?);
    }
    Ok(items)
}

/// Datetimes travel as ISO-8601 text.  Offset-carrying forms parse as-is;
/// naive forms are interpreted as UTC.
fn parse_datetime(s: &str) -> Result<DateTime<FixedOffset>, WireError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt);
    }
    NaiveDateTime::from_str(s)
        .map(|naive| naive.and_utc().fixed_offset())
        .map_err(|e| WireError::InvalidValue {
            what: "datetime",
            detail: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_a_single_tag_byte() {
        assert_eq!(encode(&Value::Null), vec![0x00]);
    }

    #[test]
    fn small_int_is_tag_plus_eight_bytes() {
        let bytes = encode(&Value::from(42));
        assert_eq!(bytes[0], tag::INT);
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[1..], 42i64.to_be_bytes());
    }

    #[test]
    fn negative_int_uses_negative_tag() {
        let bytes = encode(&Value::from(-1));
        assert_eq!(bytes[0], tag::INT_NEG);
        assert_eq!(&bytes[1..], (-1i64).to_be_bytes());
    }

    #[test]
    fn string_is_length_prefixed_utf8() {
        let bytes = encode(&Value::from("hi"));
        assert_eq!(bytes, vec![tag::STR, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(decode(&[]), Err(WireError::EmptyInput)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(decode(&[0x7F]), Err(WireError::UnknownTag(0x7F))));
    }

    #[test]
    fn truncated_input_is_rejected() {
        // String claiming 5 bytes with only 2 present.
        let data = [tag::STR, 0, 0, 0, 5, b'h', b'i'];
        assert!(matches!(decode(&data), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut data = encode(&Value::Null);
        data.push(0xFF);
        assert!(matches!(decode(&data), Err(WireError::TrailingBytes(1))));
    }

    #[test]
    fn mapping_preserves_insertion_order() {
        let mut map = Map::new();
        map.insert(Value::from("z"), Value::from(1));
        map.insert(Value::from("a"), Value::from(2));
        map.insert(Value::from("m"), Value::from(3));
        let decoded = decode(&encode(&Value::Mapping(map))).unwrap();
        let keys: Vec<&str> = decoded
            .as_mapping()
            .unwrap()
            .keys()
            .map(|k| k.as_str().unwrap())
            .collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn named_record_tag_decodes_like_record() {
        let record = Value::Record(
            Record::new("app.Point")
                .field("x", Value::from(1))
                .field("y", Value::from(2)),
        );
        let mut bytes = encode(&record);
        assert_eq!(bytes[0], tag::RECORD);
        bytes[0] = tag::NAMED_RECORD;
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn naive_datetime_decodes_as_utc() {
        let mut buf = BytesMut::new();
        buf.put_u8(tag::DATETIME);
        let iso = b"2024-06-01T12:30:00";
        buf.put_u32(iso.len() as u32);
        buf.put_slice(iso);
        let decoded = decode(&buf).unwrap();
        match decoded {
            Value::DateTime(dt) => assert_eq!(dt.to_rfc3339(), "2024-06-01T12:30:00+00:00"),
            other => panic!("expected datetime, got {other:?}"),
        }
    }
}
