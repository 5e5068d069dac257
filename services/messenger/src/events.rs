//! Application events fanned out by the notify hub.
//!
//! On the wire an event is a record `{type, data}` so subscribers in any
//! implementation can dispatch on the `type` string.

use htcp_protocol::{Arguments, Record, Value};

/// Qualified record name used for events on the wire.
pub const EVENT_TYPE_NAME: &str = "messenger.Event";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub data: Arguments,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Arguments) -> Event {
        Event {
            kind: kind.into(),
            data,
        }
    }

    /// Wire form: a record with the event kind and its payload mapping.
    pub fn into_value(self) -> Value {
        let mut data = htcp_protocol::Map::new();
        for (key, value) in self.data {
            data.insert(Value::Str(key), value);
        }
        Value::Record(
            Record::new(EVENT_TYPE_NAME)
                .field("type", Value::Str(self.kind))
                .field("data", Value::Mapping(data)),
        )
    }

    pub fn from_value(value: &Value) -> Option<Event> {
        let record = match value {
            Value::Record(record) => record,
            _ => return None,
        };
        let kind = record.get("type")?.as_str()?.to_owned();
        let mut data = Arguments::new();
        if let Some(Value::Mapping(map)) = record.get("data") {
            for (key, field) in map {
                if let Value::Str(name) = key {
                    data.insert(name.clone(), field.clone());
                }
            }
        }
        Some(Event { kind, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htcp_protocol::arguments;

    #[test]
    fn event_roundtrips_through_its_wire_form() {
        let event = Event::new("typing", arguments! {"chat_id" => 4, "user_id" => 9});
        let back = Event::from_value(&event.clone().into_value()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn non_record_values_are_not_events() {
        assert!(Event::from_value(&Value::from(1)).is_none());
    }
}
