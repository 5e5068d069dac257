//! The self-describing value model carried by every HTCP payload.
//!
//! `Value` is a closed tagged sum: what the wire grammar can express is
//! exactly what this enum can hold.  Containers preserve insertion order;
//! sets compare order-insensitively.  Integers are arbitrary precision
//! (`BigInt`) — the codec picks the compact 8-byte form whenever the value
//! fits an `i64`.
//!
//! # Equality
//!
//! Floats (and the components of `Complex`) compare by bit pattern, so
//! `NaN == NaN` holds and round-trip assertions work on any float.
//! Mappings compare as maps (order-insensitive, like the wire producers
//! they interoperate with); order is still preserved on decode.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta};
use indexmap::IndexMap;
use num_bigint::BigInt;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Insertion-ordered mapping with arbitrary value keys.
pub type Map = IndexMap<Value, Value>;

/// String-keyed argument mapping, as carried by call and subscribe packets.
pub type Arguments = IndexMap<String, Value>;

/// A record value: a qualified type name plus ordered named fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub type_name: String,
    pub fields: IndexMap<String, Value>,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Record {
        Record {
            type_name: type_name.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: Value) -> Record {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_name.hash(state);
        for (name, value) in &self.fields {
            name.hash(state);
            value.hash(state);
        }
    }
}

/// An enumeration member: qualified enum type name plus member name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumMember {
    pub type_name: String,
    pub member: String,
}

impl EnumMember {
    pub fn new(type_name: impl Into<String>, member: impl Into<String>) -> EnumMember {
        EnumMember {
            type_name: type_name.into(),
            member: member.into(),
        }
    }
}

/// Decoded in-memory form of every serializable value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(BigInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Mapping(Map),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Record(Record),
    DateTime(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
    Duration(TimeDelta),
    Decimal(Decimal),
    Complex { re: f64, im: f64 },
    Uuid(Uuid),
    Enum(EnumMember),
}

impl Value {
    /// Short kind name, used in error messages and coercion diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Mapping(_) => "mapping",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozen-set",
            Value::Record(_) => "record",
            Value::DateTime(_) => "datetime",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Decimal(_) => "decimal",
            Value::Complex { .. } => "complex",
            Value::Uuid(_) => "uuid",
            Value::Enum(_) => "enum",
        }
    }

    /// Build a set value, collapsing duplicate elements.
    pub fn set(elements: Vec<Value>) -> Value {
        Value::Set(dedup(elements))
    }

    /// Build a frozen-set value, collapsing duplicate elements.
    pub fn frozen_set(elements: Vec<Value>) -> Value {
        Value::FrozenSet(dedup(elements))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => num_traits::ToPrimitive::to_i64(i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Map> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Look up a string key in a mapping value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let map = self.as_mapping()?;
        map.iter()
            .find(|(k, _)| matches!(k, Value::Str(s) if s == key))
            .map(|(_, v)| v)
    }
}

fn dedup(elements: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(elements.len());
    for element in elements {
        if !out.contains(&element) {
            out.push(element);
        }
    }
    out
}

/// Order-insensitive element comparison for set semantics.  Elements are
/// unique within a set, so mutual containment plus equal length suffices.
fn set_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Mapping(a), Value::Mapping(b)) => a == b,
            (Value::Set(a), Value::Set(b)) | (Value::FrozenSet(a), Value::FrozenSet(b)) => {
                set_eq(a, b)
            }
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (
                Value::Complex { re: ar, im: ai },
                Value::Complex { re: br, im: bi },
            ) => ar.to_bits() == br.to_bits() && ai.to_bits() == bi.to_bits(),
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::List(items) | Value::Tuple(items) => {
                for item in items {
                    item.hash(state);
                }
            }
            // Mappings and sets compare order-insensitively, so their
            // hashes combine element hashes commutatively.
            Value::Mapping(map) => {
                let mut acc: u64 = 0;
                for (k, v) in map {
                    acc ^= sub_hash(&(k, v));
                }
                acc.hash(state);
            }
            Value::Set(items) | Value::FrozenSet(items) => {
                let mut acc: u64 = 0;
                for item in items {
                    acc ^= sub_hash(item);
                }
                acc.hash(state);
            }
            Value::Record(r) => r.hash(state),
            Value::DateTime(dt) => dt.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Time(t) => t.hash(state),
            Value::Duration(d) => {
                d.num_seconds().hash(state);
                d.subsec_nanos().hash(state);
            }
            Value::Decimal(d) => d.hash(state),
            Value::Complex { re, im } => {
                re.to_bits().hash(state);
                im.to_bits().hash(state);
            }
            Value::Uuid(u) => u.hash(state),
            Value::Enum(e) => e.hash(state),
        }
    }
}

fn sub_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(BigInt::from(v))
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Value {
        Value::Uuid(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}
