//! Lifting loosely-typed decoded values to a declared schema.
//!
//! The decoder never recovers static types from the wire; records arrive
//! as records (or plain mappings from other producers) and enums as enum
//! members.  `coerce` upgrades a decoded value to the handler's declared
//! shape, recursing through containers, and fails on any shape mismatch
//! so the caller can report invalid arguments.

use indexmap::IndexMap;

use crate::error::CoerceError;
use crate::schema::{EnumSchema, Param, RecordSchema, Schema};
use crate::value::{Arguments, EnumMember, Map, Record, Value};

/// Coerce one value to a declared schema.
pub fn coerce(value: Value, schema: &Schema) -> Result<Value, CoerceError> {
    match schema {
        Schema::Any => Ok(value),
        Schema::Optional(inner) => {
            if value.is_null() {
                Ok(value)
            } else {
                coerce(value, inner)
            }
        }
        Schema::Null => expect(value, "null", |v| matches!(v, Value::Null)),
        Schema::Bool => expect(value, "bool", |v| matches!(v, Value::Bool(_))),
        Schema::Int => expect(value, "int", |v| matches!(v, Value::Int(_))),
        Schema::Float => match value {
            Value::Float(_) => Ok(value),
            // Numeric widening: an integer argument satisfies a float
            // parameter.
            Value::Int(ref i) => match num_traits::ToPrimitive::to_f64(i) {
                Some(f) => Ok(Value::Float(f)),
                None => Err(shape("float", &value)),
            },
            other => Err(shape("float", &other)),
        },
        Schema::Str => expect(value, "string", |v| matches!(v, Value::Str(_))),
        Schema::Bytes => expect(value, "bytes", |v| matches!(v, Value::Bytes(_))),
        Schema::DateTime => expect(value, "datetime", |v| matches!(v, Value::DateTime(_))),
        Schema::Date => expect(value, "date", |v| matches!(v, Value::Date(_))),
        Schema::Time => expect(value, "time", |v| matches!(v, Value::Time(_))),
        Schema::Duration => expect(value, "duration", |v| matches!(v, Value::Duration(_))),
        Schema::Decimal => expect(value, "decimal", |v| matches!(v, Value::Decimal(_))),
        Schema::Complex => expect(value, "complex", |v| matches!(v, Value::Complex { .. })),
        Schema::Uuid => expect(value, "uuid", |v| matches!(v, Value::Uuid(_))),
        Schema::List(element) => {
            let items = into_elements(value, "list")?;
            Ok(Value::List(coerce_all(items, element)?))
        }
        Schema::Set(element) => {
            let items = into_elements(value, "set")?;
            Ok(Value::set(coerce_all(items, element)?))
        }
        Schema::FrozenSet(element) => {
            let items = into_elements(value, "frozen-set")?;
            Ok(Value::frozen_set(coerce_all(items, element)?))
        }
        Schema::TupleOf(element) => {
            let items = into_elements(value, "tuple")?;
            Ok(Value::Tuple(coerce_all(items, element)?))
        }
        Schema::Tuple(elements) => {
            let items = into_elements(value, "tuple")?;
            if items.len() != elements.len() {
                return Err(CoerceError::TupleArity {
                    expected: elements.len(),
                    actual: items.len(),
                });
            }
            let coerced = items
                .into_iter()
                .zip(elements)
                .map(|(item, element)| coerce(item, element))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tuple(coerced))
        }
        Schema::Mapping(key_schema, value_schema) => match value {
            Value::Mapping(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(coerce(k, key_schema)?, coerce(v, value_schema)?);
                }
                Ok(Value::Mapping(out))
            }
            other => Err(shape("mapping", &other)),
        },
        Schema::Record(record_schema) => coerce_record(value, record_schema),
        Schema::Enum(enum_schema) => coerce_enum(value, enum_schema),
    }
}

/// Coerce a call's argument mapping against the declared parameters.
/// Declared parameters coerce by their schema; undeclared arguments pass
/// through untouched; missing parameters stay absent (handlers supply
/// their own defaults).
pub fn prepare_arguments(params: &[Param], args: Arguments) -> Result<Arguments, CoerceError> {
    let mut prepared = Arguments::with_capacity(args.len());
    for (name, value) in args {
        match params.iter().find(|p| p.name == name) {
            Some(param) => {
                prepared.insert(name, coerce(value, &param.schema)?);
            }
            None => {
                prepared.insert(name, value);
            }
        }
    }
    Ok(prepared)
}

fn expect(value: Value, expected: &'static str, pred: fn(&Value) -> bool) -> Result<Value, CoerceError> {
    if pred(&value) {
        Ok(value)
    } else {
        Err(shape(expected, &value))
    }
}

fn shape(expected: &'static str, actual: &Value) -> CoerceError {
    CoerceError::Shape {
        expected,
        actual: actual.kind(),
    }
}

fn into_elements(value: Value, expected: &'static str) -> Result<Vec<Value>, CoerceError> {
    match value {
        Value::List(items)
        | Value::Tuple(items)
        | Value::Set(items)
        | Value::FrozenSet(items) => Ok(items),
        other => Err(shape(expected, &other)),
    }
}

fn coerce_all(items: Vec<Value>, element: &Schema) -> Result<Vec<Value>, CoerceError> {
    items.into_iter().map(|item| coerce(item, element)).collect()
}

fn coerce_record(value: Value, schema: &RecordSchema) -> Result<Value, CoerceError> {
    let mut provided: IndexMap<String, Value> = match value {
        Value::Record(record) => record.fields,
        Value::Mapping(map) => {
            let mut fields = IndexMap::with_capacity(map.len());
            for (k, v) in map {
                match k {
                    Value::Str(name) => {
                        fields.insert(name, v);
                    }
                    _ => {
                        return Err(CoerceError::NonStringField {
                            record: schema.type_name.clone(),
                        })
                    }
                }
            }
            fields
        }
        other => return Err(shape("record", &other)),
    };

    let mut record = Record::new(schema.type_name.clone());
    for (name, field_schema) in &schema.fields {
        match provided.shift_remove(name) {
            Some(field_value) => {
                record
                    .fields
                    .insert(name.clone(), coerce(field_value, field_schema)?);
            }
            None => {
                return Err(CoerceError::MissingField {
                    record: schema.type_name.clone(),
                    field: name.clone(),
                })
            }
        }
    }
    // Undeclared fields from the wire are dropped.
    Ok(Value::Record(record))
}

fn coerce_enum(value: Value, schema: &EnumSchema) -> Result<Value, CoerceError> {
    let member = match &value {
        Value::Enum(e) => e.member.clone(),
        // Sentinel mapping form produced by peers without enum support:
        // {"__enum__": <type>, "__member__": <name>}.
        Value::Mapping(_) => match value.get("__member__").and_then(Value::as_str) {
            Some(member) => member.to_owned(),
            None => return Err(shape("enum", &value)),
        },
        other => return Err(shape("enum", other)),
    };
    if !schema.members.iter().any(|m| m == &member) {
        return Err(CoerceError::UnknownEnumMember {
            enum_name: schema.type_name.clone(),
            member,
        });
    }
    Ok(Value::Enum(EnumMember::new(schema.type_name.clone(), member)))
}
