//! Typed message envelopes, one per packet kind.
//!
//! Every envelope encodes to a mapping payload via the value codec and
//! parses leniently: missing fields take their defaults (empty string,
//! empty arguments, success code) so that older peers remain readable.

use crate::codec;
use crate::error::WireError;
use crate::value::{Arguments, Map, Value};
use crate::wire::{ErrorCode, Packet, PacketType};

fn mapping_payload(packet: &Packet) -> Result<Map, WireError> {
    match codec::decode(&packet.payload)? {
        Value::Mapping(map) => Ok(map),
        other => Err(WireError::InvalidValue {
            what: "message payload",
            detail: format!("expected mapping, got {}", other.kind()),
        }),
    }
}

fn encode_mapping(entries: Vec<(&str, Value)>) -> Vec<u8> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(Value::from(key), value);
    }
    codec::encode(&Value::Mapping(map))
}

fn get_str(map: &Map, key: &str) -> String {
    lookup(map, key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn get_bool(map: &Map, key: &str) -> bool {
    lookup(map, key).and_then(Value::as_bool).unwrap_or(false)
}

fn get_code(map: &Map, key: &str) -> ErrorCode {
    lookup(map, key)
        .and_then(Value::as_i64)
        .map_or(ErrorCode::Success, ErrorCode::from_i64)
}

fn get_value(map: &Map, key: &str) -> Value {
    lookup(map, key).cloned().unwrap_or(Value::Null)
}

fn get_arguments(map: &Map, key: &str) -> Arguments {
    let mut args = Arguments::new();
    if let Some(Value::Mapping(inner)) = lookup(map, key) {
        for (k, v) in inner {
            if let Value::Str(name) = k {
                args.insert(name.clone(), v.clone());
            }
        }
    }
    args
}

fn lookup<'a>(map: &'a Map, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Str(s) if s == key))
        .map(|(_, v)| v)
}

fn arguments_value(args: &Arguments) -> Value {
    let mut map = Map::new();
    for (name, value) in args {
        map.insert(Value::Str(name.clone()), value.clone());
    }
    Value::Mapping(map)
}

// ---------------------------------------------------------------------------
// Session establishment
// ---------------------------------------------------------------------------

/// Handshake request; carries no payload.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest;

impl HandshakeRequest {
    pub fn to_packet(&self) -> Packet {
        Packet::empty(PacketType::HandshakeRequest)
    }
}

/// Handshake response: server display name plus the advertised
/// transaction codes (empty when the server hides them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub server_name: String,
    pub transactions: Vec<String>,
}

impl HandshakeResponse {
    pub fn to_packet(&self) -> Packet {
        let transactions = Value::List(
            self.transactions
                .iter()
                .map(|code| Value::from(code.as_str()))
                .collect(),
        );
        Packet::new(
            PacketType::HandshakeResponse,
            encode_mapping(vec![
                ("server_name", Value::from(self.server_name.as_str())),
                ("transactions", transactions),
            ]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<HandshakeResponse, WireError> {
        let map = mapping_payload(packet)?;
        let transactions = match lookup(&map, "transactions") {
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        };
        Ok(HandshakeResponse {
            server_name: get_str(&map, "server_name"),
            transactions,
        })
    }
}

// ---------------------------------------------------------------------------
// Request / reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCall {
    pub transaction: String,
    pub arguments: Arguments,
}

impl TransactionCall {
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::TransactionCall,
            encode_mapping(vec![
                ("transaction", Value::from(self.transaction.as_str())),
                ("arguments", arguments_value(&self.arguments)),
            ]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<TransactionCall, WireError> {
        let map = mapping_payload(packet)?;
        Ok(TransactionCall {
            transaction: get_str(&map, "transaction"),
            arguments: get_arguments(&map, "arguments"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub success: bool,
    pub result: Value,
    pub error_code: ErrorCode,
    pub error_message: String,
}

impl TransactionResult {
    pub fn ok(result: Value) -> TransactionResult {
        TransactionResult {
            success: true,
            result,
            error_code: ErrorCode::Success,
            error_message: String::new(),
        }
    }

    pub fn failure(error_code: ErrorCode, error_message: impl Into<String>) -> TransactionResult {
        TransactionResult {
            success: false,
            result: Value::Null,
            error_code,
            error_message: error_message.into(),
        }
    }

    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::TransactionResult,
            encode_mapping(vec![
                ("success", Value::Bool(self.success)),
                ("result", self.result.clone()),
                ("error_code", Value::from(self.error_code.as_i64())),
                ("error_message", Value::from(self.error_message.as_str())),
            ]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<TransactionResult, WireError> {
        let map = mapping_payload(packet)?;
        Ok(TransactionResult {
            success: get_bool(&map, "success"),
            result: get_value(&map, "result"),
            error_code: get_code(&map, "error_code"),
            error_message: get_str(&map, "error_message"),
        })
    }
}

/// Standalone error packet, used for protocol-level failures outside the
/// request/reply pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error_code: ErrorCode,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> ErrorMessage {
        ErrorMessage {
            error_code,
            message: message.into(),
        }
    }

    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::Error,
            encode_mapping(vec![
                ("error_code", Value::from(self.error_code.as_i64())),
                ("message", Value::from(self.message.as_str())),
            ]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<ErrorMessage, WireError> {
        let map = mapping_payload(packet)?;
        Ok(ErrorMessage {
            error_code: get_code(&map, "error_code"),
            message: get_str(&map, "message"),
        })
    }
}

/// Disconnect notification; carries no payload.
#[derive(Debug, Clone, Default)]
pub struct Disconnect;

impl Disconnect {
    pub fn to_packet(&self) -> Packet {
        Packet::empty(PacketType::Disconnect)
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub subscription_id: String,
    pub event_type: String,
    pub arguments: Arguments,
}

impl SubscribeRequest {
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::SubscribeRequest,
            encode_mapping(vec![
                (
                    "subscription_id",
                    Value::from(self.subscription_id.as_str()),
                ),
                ("event_type", Value::from(self.event_type.as_str())),
                ("arguments", arguments_value(&self.arguments)),
            ]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<SubscribeRequest, WireError> {
        let map = mapping_payload(packet)?;
        Ok(SubscribeRequest {
            subscription_id: get_str(&map, "subscription_id"),
            event_type: get_str(&map, "event_type"),
            arguments: get_arguments(&map, "arguments"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub subscription_id: String,
}

impl UnsubscribeRequest {
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::UnsubscribeRequest,
            encode_mapping(vec![(
                "subscription_id",
                Value::from(self.subscription_id.as_str()),
            )]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<UnsubscribeRequest, WireError> {
        let map = mapping_payload(packet)?;
        Ok(UnsubscribeRequest {
            subscription_id: get_str(&map, "subscription_id"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeData {
    pub subscription_id: String,
    pub data: Value,
}

impl SubscribeData {
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::SubscribeData,
            encode_mapping(vec![
                (
                    "subscription_id",
                    Value::from(self.subscription_id.as_str()),
                ),
                ("data", self.data.clone()),
            ]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<SubscribeData, WireError> {
        let map = mapping_payload(packet)?;
        Ok(SubscribeData {
            subscription_id: get_str(&map, "subscription_id"),
            data: get_value(&map, "data"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeEnd {
    pub subscription_id: String,
}

impl SubscribeEnd {
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::SubscribeEnd,
            encode_mapping(vec![(
                "subscription_id",
                Value::from(self.subscription_id.as_str()),
            )]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<SubscribeEnd, WireError> {
        let map = mapping_payload(packet)?;
        Ok(SubscribeEnd {
            subscription_id: get_str(&map, "subscription_id"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeError {
    pub subscription_id: String,
    pub error_code: ErrorCode,
    pub message: String,
}

impl SubscribeError {
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::SubscribeError,
            encode_mapping(vec![
                (
                    "subscription_id",
                    Value::from(self.subscription_id.as_str()),
                ),
                ("error_code", Value::from(self.error_code.as_i64())),
                ("message", Value::from(self.message.as_str())),
            ]),
        )
    }

    pub fn from_packet(packet: &Packet) -> Result<SubscribeError, WireError> {
        let map = mapping_payload(packet)?;
        Ok(SubscribeError {
            subscription_id: get_str(&map, "subscription_id"),
            error_code: get_code(&map, "error_code"),
            message: get_str(&map, "message"),
        })
    }
}

/// Build an `Arguments` map in place; mirrors the literal-map ergonomics
/// used throughout the handlers and tests.
#[macro_export]
macro_rules! arguments {
    () => { $crate::Arguments::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut args = $crate::Arguments::new();
        $(args.insert(String::from($key), $crate::Value::from($value));)+
        args
    }};
}
