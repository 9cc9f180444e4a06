use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::*;

fn host_cursor() -> Cursor {
    Cursor {
        cursor_type: CursorType::Host,
        cluster_time: ClusterTime::new(1588853652, 0),
        oid: "5eb385974770a118f4922abe".to_string(),
        oper: OperType::Update,
        uniq_key: String::new(),
    }
}

#[test]
fn encode_then_decode_returns_same_host_cursor() {
    let cursor = host_cursor();
    let encoded = cursor.encode().unwrap();

    assert_eq!(
        encoded,
        "MQ0yDTVlYjM4NTk3NDc3MGExMThmNDkyMmFiZQ11cGRhdGUNMTU4ODg1MzY1Mg0wDQ=="
    );
    let decoded = Cursor::decode(&encoded).unwrap();
    assert_eq!(decoded.cursor_type, CursorType::Host);
    assert_eq!(decoded.cluster_time, ClusterTime::new(1588853652, 0));
    assert_eq!(decoded.oid, "5eb385974770a118f4922abe");
    assert_eq!(decoded.oper, OperType::Update);
    assert_eq!(decoded, cursor);
}

#[test]
fn unique_key_survives_round_trip() {
    let cursor = Cursor::for_event(
        CursorType::InstAsst,
        ClusterTime::new(1700000000, 7),
        "42",
        OperType::Insert,
        1024,
    );
    let decoded = Cursor::decode(&cursor.encode().unwrap()).unwrap();
    assert_eq!(decoded.uniq_key, "1024");
    assert_eq!(decoded, cursor);
}

#[test]
fn no_event_constant_matches_sentinel_encoding() {
    assert_eq!(no_event_cursor().encode().unwrap(), NO_EVENT_CURSOR);
    let decoded = Cursor::decode(NO_EVENT_CURSOR).unwrap();
    assert_eq!(decoded.cursor_type, CursorType::NoEvent);
    assert!(is_no_event_cursor(NO_EVENT_CURSOR));
}

#[test]
fn other_operations_are_kept_verbatim() {
    let mut cursor = host_cursor();
    cursor.oper = OperType::from("shardCollection");
    let decoded = Cursor::decode(&cursor.encode().unwrap()).unwrap();
    assert_eq!(decoded.oper, OperType::Other("shardCollection".to_string()));
}

#[test]
fn encode_rejects_incomplete_cursors() {
    let mut c = host_cursor();
    c.cursor_type = CursorType::Unknown;
    assert!(c.encode().is_err());

    let mut c = host_cursor();
    c.cluster_time.sec = 0;
    assert!(c.encode().is_err());

    let mut c = host_cursor();
    c.oid.clear();
    assert!(c.encode().is_err());

    let mut c = host_cursor();
    c.oper = OperType::Other(String::new());
    assert!(c.encode().is_err());
}

#[test]
fn decode_rejects_structural_violations() {
    let enc = |s: &str| STANDARD.encode(s);

    // not base64
    assert!(Cursor::decode("%%%").is_err());
    // wrong version
    assert!(Cursor::decode(&enc("2\r2\roid\rupdate\r1\r0\r")).is_err());
    // unknown type code
    assert!(Cursor::decode(&enc("1\r99\roid\rupdate\r1\r0\r")).is_err());
    // non numeric type code
    assert!(Cursor::decode(&enc("1\rhost\roid\rupdate\r1\r0\r")).is_err());
    // empty operation
    assert!(Cursor::decode(&enc("1\r2\roid\r\r1\r0\r")).is_err());
    // malformed seconds and nanos
    assert!(Cursor::decode(&enc("1\r2\roid\rupdate\rx\r0\r")).is_err());
    assert!(Cursor::decode(&enc("1\r2\roid\rupdate\r1\r-1\r")).is_err());
    // too few fields
    assert!(Cursor::decode(&enc("1\r2\roid\rupdate\r1")).is_err());
}

#[test]
fn decode_accepts_six_field_form() {
    let decoded = Cursor::decode(&STANDARD.encode("1\r4\r12\rdelete\r10\r3")).unwrap();
    assert_eq!(decoded.cursor_type, CursorType::Biz);
    assert_eq!(decoded.oper, OperType::Delete);
    assert_eq!(decoded.uniq_key, "");
}

#[test]
fn cursor_type_codes_are_stable() {
    for t in CursorType::WATCHABLE {
        assert_eq!(CursorType::from_int(t.to_int()), t);
        assert_eq!(CursorType::from_name(t.as_str()), t);
    }
    assert_eq!(CursorType::from_int(0), CursorType::Unknown);
    assert_eq!(CursorType::from_name("nope"), CursorType::Unknown);
}

#[test]
fn event_cursor_keys_on_positive_instance_id() {
    let event = crate::test_utils::change_event(
        "cc_HostBase",
        "oid-7",
        OperType::Insert,
        100,
        2,
        serde_json::json!({"bk_host_id": 7}),
    );

    let with_id = Cursor::decode(&event_cursor(CursorType::Host, &event, 7).unwrap()).unwrap();
    assert_eq!(with_id.uniq_key, "7");
    assert_eq!(with_id.oid, "oid-7");
    assert_eq!(with_id.cluster_time, ClusterTime::new(100, 2));

    let without = Cursor::decode(&event_cursor(CursorType::Host, &event, 0).unwrap()).unwrap();
    assert_eq!(without.uniq_key, "");
}
