//! Byte-level contract tests for the packet header and message envelopes.
//!
//! These pin the frozen wire layout: if any assertion here starts
//! failing, the change is a protocol break, not a refactor.

use htcp_protocol::codec;
use htcp_protocol::message::{
    ErrorMessage, HandshakeRequest, HandshakeResponse, SubscribeRequest, TransactionCall,
    TransactionResult,
};
use htcp_protocol::wire::{Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use htcp_protocol::{arguments, ErrorCode, PacketType, Value, WireError};

#[test]
fn handshake_request_is_the_twelve_canonical_bytes() {
    let bytes = HandshakeRequest.to_packet().to_bytes();
    assert_eq!(
        bytes,
        [0x48, 0x54, 0x43, 0x50, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn header_is_always_twelve_bytes() {
    for payload_len in [0usize, 1, 100, 65_536] {
        let packet = Packet::new(PacketType::SubscribeData, vec![0xAA; payload_len]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + payload_len);
        assert_eq!(&bytes[..4], b"HTCP");
        assert_eq!(bytes[4], 1);
        let length = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        assert_eq!(length, payload_len);
        assert_eq!(&bytes[10..12], &[0, 0]);
    }
}

#[test]
fn every_packet_type_byte_is_stable() {
    let expected: [(PacketType, u8); 11] = [
        (PacketType::HandshakeRequest, 0x01),
        (PacketType::TransactionCall, 0x02),
        (PacketType::Disconnect, 0x03),
        (PacketType::SubscribeRequest, 0x04),
        (PacketType::UnsubscribeRequest, 0x05),
        (PacketType::HandshakeResponse, 0x11),
        (PacketType::TransactionResult, 0x12),
        (PacketType::Error, 0x13),
        (PacketType::SubscribeData, 0x14),
        (PacketType::SubscribeEnd, 0x15),
        (PacketType::SubscribeError, 0x16),
    ];
    for (packet_type, byte) in expected {
        assert_eq!(packet_type.as_byte(), byte);
        assert_eq!(PacketType::from_byte(byte), Some(packet_type));
    }
    // Gaps stay unassigned.
    for byte in [0x00, 0x06, 0x10, 0x17, 0xFF] {
        assert_eq!(PacketType::from_byte(byte), None);
    }
}

#[test]
fn packet_roundtrip_at_the_payload_cap() {
    let packet = Packet::new(PacketType::SubscribeData, vec![0x5A; 1024]);
    assert_eq!(Packet::from_bytes(&packet.to_bytes()).unwrap(), packet);

    let mut oversize = Packet::empty(PacketType::SubscribeData).to_bytes();
    let too_big = u32::try_from(MAX_PAYLOAD_SIZE + 1).unwrap();
    oversize[6..10].copy_from_slice(&too_big.to_be_bytes());
    assert!(matches!(
        Packet::from_bytes(&oversize),
        Err(WireError::PayloadTooLarge { .. })
    ));
}

#[test]
fn handshake_response_payload_decodes_as_documented() {
    let packet = HandshakeResponse {
        server_name: "test".to_owned(),
        transactions: vec!["echo".to_owned()],
    }
    .to_packet();
    assert_eq!(packet.packet_type.as_byte(), 0x11);

    let payload = codec::decode(&packet.payload).unwrap();
    assert_eq!(
        payload.get("server_name").and_then(Value::as_str),
        Some("test")
    );
    match payload.get("transactions") {
        Some(Value::List(items)) => {
            assert_eq!(items, &[Value::from("echo")]);
        }
        other => panic!("expected list of codes, got {other:?}"),
    }
}

#[test]
fn call_and_result_envelopes_roundtrip() {
    let call = TransactionCall {
        transaction: "echo".to_owned(),
        arguments: arguments! {"x" => 42},
    };
    let parsed = TransactionCall::from_packet(&call.to_packet()).unwrap();
    assert_eq!(parsed.transaction, "echo");
    assert_eq!(parsed.arguments.get("x"), Some(&Value::from(42)));

    let result = TransactionResult::ok(Value::from(42));
    let parsed = TransactionResult::from_packet(&result.to_packet()).unwrap();
    assert!(parsed.success);
    assert_eq!(parsed.result, Value::from(42));
    assert_eq!(parsed.error_code, ErrorCode::Success);

    let failure = TransactionResult::failure(
        ErrorCode::UnknownTransaction,
        "Unknown transaction: nope",
    );
    let parsed = TransactionResult::from_packet(&failure.to_packet()).unwrap();
    assert!(!parsed.success);
    assert_eq!(parsed.error_code, ErrorCode::UnknownTransaction);
    assert_eq!(parsed.error_message, "Unknown transaction: nope");
}

#[test]
fn subscribe_request_carries_id_type_and_arguments() {
    let request = SubscribeRequest {
        subscription_id: "a".to_owned(),
        event_type: "ticks".to_owned(),
        arguments: arguments! {"interval_ms" => 10},
    };
    let parsed = SubscribeRequest::from_packet(&request.to_packet()).unwrap();
    assert_eq!(parsed.subscription_id, "a");
    assert_eq!(parsed.event_type, "ticks");
    assert_eq!(
        parsed.arguments.get("interval_ms"),
        Some(&Value::from(10))
    );
}

#[test]
fn argument_mapping_golden_bytes() {
    // {"x": 42} — mapping of one pair, string key, small int value.
    let mut map = htcp_protocol::Map::new();
    map.insert(Value::from("x"), Value::from(42));
    let bytes = codec::encode(&Value::Mapping(map));

    let mut expected = vec![0x09, 0, 0, 0, 1];
    expected.extend_from_slice(&[0x05, 0, 0, 0, 1, b'x']);
    expected.push(0x03);
    expected.extend_from_slice(&42i64.to_be_bytes());
    assert_eq!(bytes, expected);
}

#[test]
fn scalar_golden_bytes() {
    assert_eq!(codec::encode(&Value::Null), [0x00]);
    assert_eq!(codec::encode(&Value::Bool(true)), [0x01]);
    assert_eq!(codec::encode(&Value::Bool(false)), [0x02]);

    let float = codec::encode(&Value::Float(1.5));
    assert_eq!(float[0], 0x04);
    assert_eq!(&float[1..], 1.5f64.to_be_bytes());

    let uuid = uuid::Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10);
    let encoded = codec::encode(&Value::Uuid(uuid));
    assert_eq!(encoded[0], 0x13);
    assert_eq!(&encoded[1..], uuid.as_bytes());
}

#[test]
fn error_envelope_roundtrip() {
    let msg = ErrorMessage::new(ErrorCode::ProtocolError, "bad packet");
    let parsed = ErrorMessage::from_packet(&msg.to_packet()).unwrap();
    assert_eq!(parsed.error_code, ErrorCode::ProtocolError);
    assert_eq!(parsed.message, "bad packet");
}
